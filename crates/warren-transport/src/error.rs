/// Errors that can occur in the transport layer.
///
/// The broker-side refusals (`PreconditionFailed`, `ResourceLocked`,
/// `NotFound`) are kept apart from plain operation failures so callers
/// can tell a topology conflict from a broken connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed or was never established.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel is closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A redeclaration disagreed with the existing entity (AMQP 406).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The entity is exclusively owned by another connection (AMQP 405).
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// A referenced exchange or queue does not exist (AMQP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Declaring a queue failed for another reason.
    #[error("declare failed: {0}")]
    DeclareFailed(String),

    /// Binding a queue failed for another reason.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Publishing failed.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Starting a consumer failed.
    #[error("consume failed: {0}")]
    ConsumeFailed(String),

    /// Setting the prefetch limit failed.
    #[error("qos failed: {0}")]
    QosFailed(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("ack failed: {0}")]
    AckFailed(String),

    /// Low-level I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Returns `true` if the broker refused a redeclaration because it
    /// conflicts with existing state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_) | Self::ResourceLocked(_))
    }

    /// Returns `true` if the error means the channel or connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::ChannelClosed(_))
    }
}
