//! Message codecs for Warren.
//!
//! The pub/sub layer moves opaque bytes; a [`Codec`] turns typed values
//! into those bytes and back, and names the content type that travels
//! with each message.
//!
//! - [`JsonCodec`]: self-describing JSON via `serde_json` (feature `json`)
//! - [`BincodeCodec`]: compact positional binary via `bincode` (feature `bincode`)
//! - [`Format`]: picks one of the above at runtime
//!
//! Publisher and subscriber must agree on the codec for a given exchange
//! and routing key. Nothing checks this for them.

#[cfg(not(any(feature = "json", feature = "bincode")))]
compile_error!("warren-codec needs at least one of the `json` or `bincode` features");

mod codec;
mod error;

#[cfg(feature = "bincode")]
pub use codec::BincodeCodec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use codec::{Codec, Format};
pub use error::CodecError;
