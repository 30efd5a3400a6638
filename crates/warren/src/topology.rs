//! Queue declaration and binding.
//!
//! Exchanges are owned by whoever operates the broker; this module only
//! declares queues and binds them to exchanges that already exist.

use std::fmt;

use tracing::{debug, info};
use warren_transport::{Channel, Connection, QueueInfo, QueueOptions};

use crate::PubSubError;

/// Exchange that receives messages rejected without requeue.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "peril_dlx";

/// Lifetime of a declared queue.
///
/// The three queue flags are derived from the policy alone, so a queue is
/// either durable and shared, or transient and private. Never a mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuePolicy {
    /// Survives broker restarts; shared by any number of consumers.
    Durable,
    /// Private to the declaring connection; deleted with its last consumer.
    Transient,
}

impl QueuePolicy {
    pub fn is_durable(self) -> bool {
        matches!(self, Self::Durable)
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn is_auto_delete(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Declaration options for this policy.
    ///
    /// An empty `dead_letter_exchange` declares the queue without one.
    pub fn queue_options(self, dead_letter_exchange: &str) -> QueueOptions {
        QueueOptions {
            durable: self.is_durable(),
            exclusive: self.is_exclusive(),
            auto_delete: self.is_auto_delete(),
            dead_letter_exchange: (!dead_letter_exchange.is_empty())
                .then(|| dead_letter_exchange.to_string()),
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::Transient => f.write_str("transient"),
        }
    }
}

/// One queue bound to one exchange under one routing key.
///
/// A queue may appear in several bindings; binding the same triple twice
/// is a no-op at the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub policy: QueuePolicy,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            policy,
        }
    }

    /// A binding for a [`QueuePolicy::Durable`] queue.
    pub fn durable(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self::new(exchange, queue, routing_key, QueuePolicy::Durable)
    }

    /// A binding for a [`QueuePolicy::Transient`] queue.
    pub fn transient(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self::new(exchange, queue, routing_key, QueuePolicy::Transient)
    }

    fn validate(&self) -> Result<(), PubSubError> {
        if self.exchange.is_empty() {
            return Err(PubSubError::InvalidArgument("exchange name must not be empty"));
        }
        if self.queue.is_empty() {
            return Err(PubSubError::InvalidArgument("queue name must not be empty"));
        }
        if self.routing_key.is_empty() {
            return Err(PubSubError::InvalidArgument("routing key must not be empty"));
        }
        Ok(())
    }
}

/// Declares `queue_name` and binds it to `exchange` under `routing_key`.
///
/// Opens one channel on `conn` and returns it together with the broker's
/// view of the queue. Rejected messages are dead-lettered to
/// [`DEFAULT_DEAD_LETTER_EXCHANGE`].
///
/// # Errors
/// - [`PubSubError::InvalidArgument`] if a name is empty
/// - [`PubSubError::ConnectionUnavailable`] if no channel can be opened
/// - [`PubSubError::TopologyConflict`] if the queue exists with different
///   parameters or is exclusive to another connection
/// - [`PubSubError::DeclareFailed`] / [`PubSubError::BindFailed`] otherwise
pub async fn declare_and_bind<C: Connection>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    policy: QueuePolicy,
) -> Result<(C::Channel, QueueInfo), PubSubError> {
    let binding = Binding::new(exchange, queue_name, routing_key, policy);
    declare_binding(conn, &binding, DEFAULT_DEAD_LETTER_EXCHANGE).await
}

/// Like [`declare_and_bind`], with an explicit dead-letter exchange.
///
/// On failure the channel is closed before the error is returned.
pub async fn declare_binding<C: Connection>(
    conn: &C,
    binding: &Binding,
    dead_letter_exchange: &str,
) -> Result<(C::Channel, QueueInfo), PubSubError> {
    binding.validate()?;

    let channel = conn
        .open_channel()
        .await
        .map_err(PubSubError::ConnectionUnavailable)?;

    match declare_on(&channel, binding, dead_letter_exchange).await {
        Ok(info) => {
            info!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                policy = %binding.policy,
                "queue declared and bound"
            );
            Ok((channel, info))
        }
        Err(e) => {
            close_quietly(&channel).await;
            Err(e)
        }
    }
}

async fn declare_on<Ch: Channel>(
    channel: &Ch,
    binding: &Binding,
    dead_letter_exchange: &str,
) -> Result<QueueInfo, PubSubError> {
    let options = binding.policy.queue_options(dead_letter_exchange);

    let info = channel
        .declare_queue(&binding.queue, &options)
        .await
        .map_err(|source| {
            if source.is_conflict() {
                PubSubError::TopologyConflict {
                    queue: binding.queue.clone(),
                    source,
                }
            } else {
                PubSubError::DeclareFailed {
                    queue: binding.queue.clone(),
                    source,
                }
            }
        })?;

    channel
        .bind_queue(&binding.queue, &binding.routing_key, &binding.exchange)
        .await
        .map_err(|source| PubSubError::BindFailed {
            queue: binding.queue.clone(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
            source,
        })?;

    Ok(info)
}

/// Closes a channel, logging instead of failing.
pub(crate) async fn close_quietly<Ch: Channel>(channel: &Ch) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "channel close failed");
    }
}
