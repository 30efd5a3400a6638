//! # Warren
//!
//! Typed publish/subscribe over a message broker connection.
//!
//! Warren sits between application code and a broker transport. It
//! declares and binds queues with a fixed durability policy, serializes
//! values to message bodies, and runs background consumers that decode
//! each delivery, hand it to a handler, and settle it according to the
//! handler's [`Verdict`].
//!
//! ```text
//! publish ──► broker ──► consumer task ──► Codec::decode ──► Handler ──► ack/nack
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use warren::prelude::*;
//! use warren::transport::{Connection, ExchangeKind, MemoryBroker};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct PlayingState {
//!     is_paused: bool,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), PubSubError> {
//! let broker = MemoryBroker::new();
//! broker.declare_exchange("peril_direct", ExchangeKind::Direct);
//! let conn = broker.connect();
//!
//! let subscription = subscribe_json(
//!     &conn,
//!     "peril_direct",
//!     "pause.alice",
//!     "pause",
//!     QueuePolicy::Transient,
//!     |state: PlayingState| {
//!         println!("paused: {}", state.is_paused);
//!         Verdict::Accept
//!     },
//! )
//! .await?;
//!
//! let channel = conn.open_channel().await?;
//! publish(&channel, "peril_direct", "pause", &PlayingState { is_paused: true }).await?;
//! # subscription.cancel().await;
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod config;
mod error;
pub mod publish;
pub mod subscribe;
pub mod topology;

pub use config::{DecodeFailurePolicy, SubscribeOptions};
pub use error::PubSubError;
pub use publish::{publish, publish_bincode, publish_json, publish_with};
pub use subscribe::{
    Handler, Subscription, SubscriptionExit, Verdict, subscribe, subscribe_bincode,
    subscribe_json, subscribe_with,
};
pub use topology::{
    Binding, DEFAULT_DEAD_LETTER_EXCHANGE, QueuePolicy, declare_and_bind, declare_binding,
};

/// The transport traits and broker implementations.
pub use warren_transport as transport;

/// The codec trait and implementations.
pub use warren_codec as codec;

pub use warren_codec::{BincodeCodec, Codec, CodecError, Format, JsonCodec};

/// Convenience re-exports for applications.
///
/// ```rust
/// use warren::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BincodeCodec, Binding, Codec, DecodeFailurePolicy, Format, Handler, JsonCodec,
        PubSubError, QueuePolicy, SubscribeOptions, Subscription, SubscriptionExit, Verdict,
        declare_and_bind, declare_binding, publish, publish_bincode, publish_json, publish_with,
        subscribe, subscribe_bincode, subscribe_json, subscribe_with,
    };
}
