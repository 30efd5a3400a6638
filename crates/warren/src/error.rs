//! Unified error type for Warren.

use warren_codec::CodecError;
use warren_transport::TransportError;

/// The error returned by every topology, publish, and subscribe call.
///
/// Setup-time failures carry the queue, exchange, or key they concern
/// and keep the transport or codec error as their source. Per-message
/// failures inside a running subscription are logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// No channel could be opened on the connection.
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(#[source] TransportError),

    /// The queue exists with different parameters, or is exclusive to
    /// another connection.
    #[error("queue '{queue}' conflicts with its existing declaration: {source}")]
    TopologyConflict {
        queue: String,
        source: TransportError,
    },

    /// Declaring the queue failed for a reason other than a conflict.
    #[error("failed to declare queue '{queue}': {source}")]
    DeclareFailed {
        queue: String,
        source: TransportError,
    },

    /// Binding the queue to its exchange failed.
    #[error(
        "failed to bind queue '{queue}' to exchange '{exchange}' with key '{routing_key}': {source}"
    )]
    BindFailed {
        queue: String,
        exchange: String,
        routing_key: String,
        source: TransportError,
    },

    /// The value could not be serialized; nothing was sent.
    #[error("encoding failed: {0}")]
    EncodingFailed(#[source] CodecError),

    /// A delivered body could not be deserialized.
    #[error("decoding failed: {0}")]
    DecodingFailed(#[source] CodecError),

    /// The transport rejected a publish.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Setting the prefetch limit or starting the consumer failed.
    #[error("failed to start consuming from queue '{queue}': {source}")]
    ConsumeFailed {
        queue: String,
        source: TransportError,
    },

    /// A required name was empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl PubSubError {
    /// The transport error underneath, if there is one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::ConnectionUnavailable(source)
            | Self::Transport(source)
            | Self::TopologyConflict { source, .. }
            | Self::DeclareFailed { source, .. }
            | Self::BindFailed { source, .. }
            | Self::ConsumeFailed { source, .. } => Some(source),
            Self::EncodingFailed(_) | Self::DecodingFailed(_) | Self::InvalidArgument(_) => None,
        }
    }
}
