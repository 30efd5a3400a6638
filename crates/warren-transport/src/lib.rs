//! Broker connection abstraction for Warren.
//!
//! Provides the [`Connection`], [`Channel`], [`Consumer`], and [`Delivery`]
//! traits that the pub/sub layer is written against. A connection is
//! dialled by the application; everything Warren does goes through a
//! channel opened on it.
//!
//! # Feature Flags
//!
//! - `memory` (default): in-process broker, used by tests and local runs
//! - `amqp`: RabbitMQ client via `lapin`

mod error;
#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "memory")]
mod memory;

pub use error::TransportError;
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection, AmqpConsumer, AmqpDelivery};
#[cfg(feature = "memory")]
pub use memory::{
    ExchangeKind, MemoryBroker, MemoryChannel, MemoryConnection,
    MemoryConsumer, MemoryDelivery,
};

use std::future::Future;

/// Queue argument naming the exchange that receives rejected messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Parameters for declaring a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Only usable by the declaring connection; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once the last consumer goes away.
    pub auto_delete: bool,
    /// Where rejected-without-requeue messages are routed.
    pub dead_letter_exchange: Option<String>,
}

/// Parameters for starting a consumer.
///
/// The default is a manual-ack, shared consumer with a broker-assigned tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Consumer tag. Empty lets the broker generate one.
    pub consumer_tag: String,
    /// Deliveries are considered settled as soon as they are sent.
    pub auto_ack: bool,
    /// Request to be the queue's only consumer.
    pub exclusive: bool,
    /// Do not deliver messages published on this connection.
    pub no_local: bool,
    /// Do not wait for the broker to confirm the consumer.
    pub no_wait: bool,
}

/// What the broker reports back after a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// The declared queue's name.
    pub name: String,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
    /// Active consumers at declaration time.
    pub consumer_count: u32,
}

/// A live connection to a broker.
///
/// Connections are shared by reference; each operation that needs a
/// channel opens its own.
pub trait Connection: Send + Sync + 'static {
    /// The channel type opened on this connection.
    type Channel: Channel;

    /// Opens a new channel.
    fn open_channel(
        &self,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Closes the connection and every channel on it.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Whether the connection can still open channels.
    fn is_open(&self) -> bool;
}

/// A single channel: the unit of topology, publishing, and consuming.
pub trait Channel: Send + Sync + 'static {
    /// The consumer type produced by [`consume`](Self::consume).
    type Consumer: Consumer;

    /// Declares a queue, or checks an existing one has the same options.
    fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> impl Future<Output = Result<QueueInfo, TransportError>> + Send;

    /// Binds `queue` to `exchange` under `routing_key`.
    fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publishes one message to `exchange`.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Limits unacknowledged deliveries per consumer. `0` means no limit.
    ///
    /// Applies to consumers started on this channel afterwards.
    fn set_prefetch(
        &self,
        count: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts consuming from `queue`.
    fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> impl Future<Output = Result<Self::Consumer, TransportError>> + Send;

    /// Closes the channel. Unacknowledged deliveries go back to their queue.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A stream of deliveries from one queue.
pub trait Consumer: Send + 'static {
    /// The delivery type yielded by this consumer.
    type Delivery: Delivery;

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the consumer is cancelled or its channel or
    /// connection closes.
    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Option<Result<Self::Delivery, TransportError>>> + Send;
}

/// One delivered message, owned until it is acknowledged or rejected.
///
/// `ack` and `nack` take `self`, so a delivery is resolved at most once.
pub trait Delivery: Send + 'static {
    /// The message body.
    fn body(&self) -> &[u8];

    /// The content type the publisher attached, if any.
    fn content_type(&self) -> Option<&str>;

    /// The routing key the message was published with.
    fn routing_key(&self) -> &str;

    /// Whether this message has been delivered before.
    fn redelivered(&self) -> bool;

    /// Acknowledges the message; the broker forgets it.
    fn ack(self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Rejects the message. With `requeue` it goes back to the queue,
    /// otherwise it is dead-lettered or dropped.
    fn nack(
        self,
        requeue: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
