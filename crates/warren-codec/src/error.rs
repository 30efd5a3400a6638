//! Error types for the codec layer.

use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur while encoding or decoding a message.
///
/// Both variants name the codec that failed and keep the underlying
/// serializer error as the source.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value could not be turned into bytes.
    #[error("{codec} encode failed: {source}")]
    Encode {
        codec: &'static str,
        #[source]
        source: BoxError,
    },

    /// Bytes could not be turned into the expected type.
    ///
    /// Usual causes are a payload written by a different codec, a
    /// truncated body, or a type mismatch between publisher and
    /// subscriber.
    #[error("{codec} decode failed: {source}")]
    Decode {
        codec: &'static str,
        #[source]
        source: BoxError,
    },
}

impl CodecError {
    pub(crate) fn encode(codec: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Encode {
            codec,
            source: source.into(),
        }
    }

    pub(crate) fn decode(codec: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Decode {
            codec,
            source: source.into(),
        }
    }

    /// The name of the codec that produced this error.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Encode { codec, .. } | Self::Decode { codec, .. } => codec,
        }
    }
}
