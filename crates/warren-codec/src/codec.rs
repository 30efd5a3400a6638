//! The [`Codec`] trait and its implementations.

use serde::{Serialize, de::DeserializeOwned};

use crate::CodecError;

/// Converts typed values to message bodies and back.
///
/// Implementations are stateless and shared across tasks, hence
/// `Send + Sync + 'static`. The methods are generic, so a codec is passed
/// by type parameter rather than as a trait object; [`Format`] covers the
/// runtime-choice case.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in logs and errors, e.g. `"json"`.
    fn name(&self) -> &'static str;

    /// The content type attached to published messages.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`CodecError::Encode`] if the value cannot be represented
    /// in this format.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserializes bytes into a value.
    ///
    /// # Errors
    /// Returns [`CodecError::Decode`] if the bytes are malformed,
    /// truncated, or do not match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use warren_codec::{Codec, JsonCodec};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct PlayingState {
///     is_paused: bool,
/// }
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&PlayingState { is_paused: true }).unwrap();
/// assert_eq!(bytes, br#"{"is_paused":true}"#);
///
/// let back: PlayingState = codec.decode(&bytes).unwrap();
/// assert!(back.is_paused);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl JsonCodec {
    pub const NAME: &'static str = "json";
    pub const CONTENT_TYPE: &'static str = "application/json";
}

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::encode(Self::NAME, e))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::decode(Self::NAME, e))
    }
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses `bincode`'s compact binary encoding.
///
/// Fields are written by position with no names or tags, so both ends
/// must agree on the exact type definition.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[cfg(feature = "bincode")]
impl BincodeCodec {
    pub const NAME: &'static str = "bincode";
    pub const CONTENT_TYPE: &'static str = "application/x-bincode";
}

#[cfg(feature = "bincode")]
impl Codec for BincodeCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::encode(Self::NAME, e))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(data).map_err(|e| CodecError::decode(Self::NAME, e))
    }
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// A codec chosen at runtime, e.g. from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    #[cfg(feature = "json")]
    Json,
    #[cfg(feature = "bincode")]
    Bincode,
}

impl Format {
    /// Looks a format up by its codec name (`"json"`, `"bincode"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            #[cfg(feature = "json")]
            JsonCodec::NAME => Some(Self::Json),
            #[cfg(feature = "bincode")]
            BincodeCodec::NAME => Some(Self::Bincode),
            _ => None,
        }
    }
}

impl Codec for Format {
    fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "json")]
            Self::Json => JsonCodec.name(),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.name(),
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            #[cfg(feature = "json")]
            Self::Json => JsonCodec.content_type(),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.content_type(),
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            #[cfg(feature = "json")]
            Self::Json => JsonCodec.encode(value),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            #[cfg(feature = "json")]
            Self::Json => JsonCodec.decode(data),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.decode(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "json")]
    #[test]
    fn test_json_metadata() {
        assert_eq!(JsonCodec.name(), "json");
        assert_eq!(JsonCodec.content_type(), "application/json");
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_bincode_metadata() {
        assert_eq!(BincodeCodec.name(), "bincode");
        assert_eq!(BincodeCodec.content_type(), "application/x-bincode");
    }

    #[cfg(all(feature = "json", feature = "bincode"))]
    #[test]
    fn test_format_from_name() {
        assert_eq!(Format::from_name("json"), Some(Format::Json));
        assert_eq!(Format::from_name("bincode"), Some(Format::Bincode));
        assert_eq!(Format::from_name("gob"), None);
    }

    #[cfg(all(feature = "json", feature = "bincode"))]
    #[test]
    fn test_format_delegates() {
        assert_eq!(Format::Json.content_type(), JsonCodec::CONTENT_TYPE);
        assert_eq!(Format::Bincode.content_type(), BincodeCodec::CONTENT_TYPE);

        let bytes = Format::Bincode.encode(&7u32).expect("encode");
        assert_eq!(bytes, BincodeCodec.encode(&7u32).expect("encode"));
    }
}
