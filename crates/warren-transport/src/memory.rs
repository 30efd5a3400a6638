//! In-process broker implementing the transport traits.
//!
//! `MemoryBroker` keeps exchanges, queues, bindings, and consumers behind
//! one mutex and follows the AMQP 0-9-1 client-visible rules closely
//! enough to exercise the pub/sub layer without a RabbitMQ server:
//!
//! - queue redeclaration must match, exclusive queues belong to one
//!   connection, auto-delete queues vanish with their last consumer
//! - deliveries are spread round-robin over consumers, each capped by the
//!   prefetch count of the channel it was started on
//! - requeued messages go back to the head of the queue, discarded ones
//!   are republished to the queue's dead-letter exchange
//!
//! `no_local` is accepted and ignored, as RabbitMQ does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{
    Channel, ConsumeOptions, Connection, Consumer, Delivery, QueueInfo,
    QueueOptions, TransportError,
};

type Shared = Arc<Mutex<BrokerState>>;

// ---------------------------------------------------------------------------
// Exchange routing
// ---------------------------------------------------------------------------

/// How an exchange matches routing keys against bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Binding key must equal the routing key.
    Direct,
    /// Dot-separated words; `*` matches one word, `#` zero or more.
    Topic,
    /// Every bound queue gets every message.
    Fanout,
}

impl ExchangeKind {
    fn matches(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Fanout => true,
            Self::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => {
            (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..]))
        }
        Some((&"*", rest)) => {
            !words.is_empty() && topic_matches(rest, &words[1..])
        }
        Some((word, rest)) => {
            words.first() == Some(word) && topic_matches(rest, &words[1..])
        }
    }
}

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    content_type: Option<String>,
    body: Arc<[u8]>,
    redelivered: bool,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    /// Declaring connection, enforced when the queue is exclusive.
    owner: u64,
    ready: VecDeque<Message>,
    /// Consumer ids in round-robin order.
    consumers: Vec<u64>,
    next_consumer: usize,
    exclusive_consumer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    prefetch: u16,
}

#[derive(Debug)]
struct ConsumerSlot {
    queue: String,
    channel: u64,
    prefetch: u16,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<MemoryDelivery>,
    cancelled: Arc<AtomicBool>,
    unacked: HashMap<u64, Message>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.auto_ack
            || self.prefetch == 0
            || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: HashSet<Binding>,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<u64, ConsumerSlot>,
    next_id: u64,
    publish_calls: u64,
}

impl BrokerState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&self, id: u64) -> Result<&ChannelState, TransportError> {
        self.channels
            .get(&id)
            .ok_or_else(|| TransportError::ChannelClosed(format!("channel {id}")))
    }

    fn declare_queue(
        &mut self,
        connection: u64,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        if let Some(queue) = self.queues.get(name) {
            if queue.options.exclusive && queue.owner != connection {
                return Err(TransportError::ResourceLocked(format!(
                    "queue '{name}' is exclusive to another connection"
                )));
            }
            if queue.options != *options {
                return Err(TransportError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(QueueInfo {
                name: name.to_string(),
                message_count: queue.ready.len() as u32,
                consumer_count: queue.consumers.len() as u32,
            });
        }

        self.queues.insert(
            name.to_string(),
            Queue {
                options: options.clone(),
                owner: connection,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                exclusive_consumer: false,
            },
        );
        tracing::debug!(queue = name, ?options, "queue declared");

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    fn check_queue_access(
        &self,
        connection: u64,
        name: &str,
    ) -> Result<&Queue, TransportError> {
        let queue = self.queues.get(name).ok_or_else(|| {
            TransportError::NotFound(format!("no queue '{name}'"))
        })?;
        if queue.options.exclusive && queue.owner != connection {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{name}' is exclusive to another connection"
            )));
        }
        Ok(queue)
    }

    fn bind_queue(
        &mut self,
        connection: u64,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), TransportError> {
        self.check_queue_access(connection, queue)?;
        if exchange.is_empty() {
            return Err(TransportError::BindFailed(
                "cannot bind to the default exchange".into(),
            ));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(TransportError::NotFound(format!(
                "no exchange '{exchange}'"
            )));
        }
        let inserted = self.bindings.insert(Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        });
        if inserted {
            tracing::debug!(queue, exchange, routing_key, "queue bound");
        }
        Ok(())
    }

    /// Delivers `message` to every queue `exchange` routes it to.
    fn route(
        &mut self,
        shared: &Shared,
        exchange: &str,
        message: Message,
    ) -> Result<(), TransportError> {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: the routing key names the queue.
            vec![message.routing_key.clone()]
        } else {
            let kind = *self.exchanges.get(exchange).ok_or_else(|| {
                TransportError::NotFound(format!("no exchange '{exchange}'"))
            })?;
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| {
                    b.exchange == exchange
                        && kind.matches(&b.routing_key, &message.routing_key)
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
                self.dispatch(shared, &name);
            }
        }
        Ok(())
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, shared: &Shared, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    self.consumers
                        .get(&queue.consumers[idx])
                        .is_some_and(ConsumerSlot::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;
            let consumer_id = queue.consumers[idx];
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let tag = self.next_id;
            let Some(slot) = self.consumers.get_mut(&consumer_id) else {
                return;
            };
            if !slot.auto_ack {
                slot.unacked.insert(tag, message.clone());
            }

            let delivery = MemoryDelivery {
                shared: Arc::clone(shared),
                consumer: consumer_id,
                tag,
                message,
            };
            if let Err(mpsc::error::SendError(delivery)) =
                slot.sender.send(delivery)
            {
                // Receiver dropped: put the message back and retire the
                // consumer, then keep dispatching to the others.
                slot.unacked.remove(&tag);
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.ready.push_front(delivery.message);
                }
                self.cancel_consumer(shared, consumer_id);
            }
        }
    }

    fn settle(
        &mut self,
        shared: &Shared,
        consumer: u64,
        tag: u64,
        settlement: Settlement,
    ) -> Result<(), TransportError> {
        let slot = self.consumers.get_mut(&consumer).ok_or_else(|| {
            TransportError::ChannelClosed(format!(
                "consumer for delivery {tag} is gone"
            ))
        })?;
        let mut message = slot.unacked.remove(&tag).ok_or_else(|| {
            TransportError::AckFailed(format!("unknown delivery tag {tag}"))
        })?;
        let queue_name = slot.queue.clone();

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    queue.ready.push_front(message);
                }
            }
            Settlement::Discard => {
                let dlx = self
                    .queues
                    .get(&queue_name)
                    .and_then(|q| q.options.dead_letter_exchange.clone());
                if let Some(dlx) = dlx {
                    message.redelivered = false;
                    if let Err(e) = self.route(shared, &dlx, message) {
                        tracing::debug!(
                            queue = %queue_name,
                            %dlx,
                            error = %e,
                            "dead-lettered message dropped"
                        );
                    }
                }
            }
        }

        self.dispatch(shared, &queue_name);
        Ok(())
    }

    /// Removes a consumer and requeues everything it had not settled.
    fn cancel_consumer(&mut self, shared: &Shared, consumer: u64) {
        let Some(slot) = self.consumers.remove(&consumer) else {
            return;
        };
        slot.cancelled.store(true, Ordering::Release);

        let Some(queue) = self.queues.get_mut(&slot.queue) else {
            return;
        };
        queue.consumers.retain(|id| *id != consumer);
        queue.exclusive_consumer = false;
        if queue.next_consumer >= queue.consumers.len() {
            queue.next_consumer = 0;
        }

        let mut pending: Vec<(u64, Message)> = slot.unacked.into_iter().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in pending.into_iter().rev() {
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        if queue.options.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(shared, &slot.queue);
        } else {
            self.dispatch(shared, &slot.queue);
        }
    }

    fn delete_queue(&mut self, shared: &Shared, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        self.bindings.retain(|b| b.queue != name);
        for consumer in queue.consumers {
            self.cancel_consumer(shared, consumer);
        }
        tracing::debug!(queue = name, "queue deleted");
    }

    fn close_channel(&mut self, shared: &Shared, channel: u64) {
        if self.channels.remove(&channel).is_none() {
            return;
        }
        let consumers: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, slot)| slot.channel == channel)
            .map(|(id, _)| *id)
            .collect();
        for consumer in consumers {
            self.cancel_consumer(shared, consumer);
        }
    }

    fn close_connection(&mut self, shared: &Shared, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(shared, channel);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.options.exclusive && q.owner == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(shared, &name);
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// An in-process broker. Cheap to clone; clones share state.
///
/// ```rust
/// use warren_transport::{ExchangeKind, MemoryBroker};
///
/// let broker = MemoryBroker::new();
/// broker.declare_exchange("peril_direct", ExchangeKind::Direct);
/// let conn = broker.connect();
/// # let _ = conn;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Shared,
}

impl MemoryBroker {
    /// Creates an empty broker with no exchanges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    ///
    /// Exchanges are broker fixtures here, the pub/sub layer only
    /// references them by name.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        lock(&self.shared).exchanges.insert(name.to_string(), kind);
    }

    /// Opens a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let mut state = lock(&self.shared);
        let id = state.alloc_id();
        state.connections.insert(id);
        MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether a queue with this name exists.
    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.shared).queues.contains_key(name)
    }

    /// Messages waiting in a queue, not counting unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        lock(&self.shared).queues.get(name).map(|q| q.ready.len())
    }

    /// Messages delivered from a queue but not yet settled.
    pub fn unacked_count(&self, name: &str) -> usize {
        lock(&self.shared)
            .consumers
            .values()
            .filter(|slot| slot.queue == name)
            .map(|slot| slot.unacked.len())
            .sum()
    }

    /// Active consumers on a queue.
    pub fn consumer_count(&self, name: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    /// The options a queue was declared with.
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        lock(&self.shared)
            .queues
            .get(name)
            .map(|q| q.options.clone())
    }

    /// `(exchange, routing_key)` pairs bound to a queue, sorted.
    pub fn queue_bindings(&self, name: &str) -> Vec<(String, String)> {
        let state = lock(&self.shared);
        let mut bindings: Vec<(String, String)> = state
            .bindings
            .iter()
            .filter(|b| b.queue == name)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    /// Number of publish calls any channel has made, including failed ones.
    pub fn publish_count(&self) -> u64 {
        lock(&self.shared).publish_calls
    }
}

// ---------------------------------------------------------------------------
// Connection / Channel / Consumer / Delivery
// ---------------------------------------------------------------------------

/// A connection to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    id: u64,
    shared: Shared,
}

impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, TransportError> {
        let mut state = lock(&self.shared);
        if !state.connections.contains(&self.id) {
            return Err(TransportError::ConnectionClosed(format!(
                "connection {} is closed",
                self.id
            )));
        }
        let id = state.alloc_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
            },
        );
        Ok(MemoryChannel {
            id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.shared).close_connection(&self.shared, self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.shared).connections.contains(&self.id)
    }
}

/// A channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    shared: Shared,
}

impl Channel for MemoryChannel {
    type Consumer = MemoryConsumer;

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let mut state = lock(&self.shared);
        state.channel(self.id)?;
        state.declare_queue(self.connection, name, options)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.channel(self.id)?;
        state.bind_queue(self.connection, queue, routing_key, exchange)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.publish_calls += 1;
        state.channel(self.id)?;
        let message = Message {
            routing_key: routing_key.to_string(),
            content_type: (!content_type.is_empty())
                .then(|| content_type.to_string()),
            body: Arc::from(payload),
            redelivered: false,
        };
        state.route(&self.shared, exchange, message)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        let channel = state.channels.get_mut(&self.id).ok_or_else(|| {
            TransportError::ChannelClosed(format!("channel {}", self.id))
        })?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<MemoryConsumer, TransportError> {
        let mut state = lock(&self.shared);
        let prefetch = state.channel(self.id)?.prefetch;
        let existing = state.check_queue_access(self.connection, queue)?;
        if existing.exclusive_consumer
            || (options.exclusive && !existing.consumers.is_empty())
        {
            return Err(TransportError::ResourceLocked(format!(
                "queue '{queue}' is in exclusive use"
            )));
        }

        let id = state.alloc_id();
        let tag = if options.consumer_tag.is_empty() {
            format!("ctag-{id}")
        } else {
            options.consumer_tag.clone()
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        state.consumers.insert(
            id,
            ConsumerSlot {
                queue: queue.to_string(),
                channel: self.id,
                prefetch,
                auto_ack: options.auto_ack,
                sender,
                cancelled: Arc::clone(&cancelled),
                unacked: HashMap::new(),
            },
        );
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(id);
            q.exclusive_consumer = options.exclusive;
        }
        tracing::debug!(queue, consumer_tag = %tag, prefetch, "consumer started");
        state.dispatch(&self.shared, queue);

        Ok(MemoryConsumer {
            tag,
            receiver,
            cancelled,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.shared).close_channel(&self.shared, self.id);
        Ok(())
    }
}

/// Deliveries for one consumer on a [`MemoryChannel`].
#[derive(Debug)]
pub struct MemoryConsumer {
    tag: String,
    receiver: mpsc::UnboundedReceiver<MemoryDelivery>,
    cancelled: Arc<AtomicBool>,
}

impl MemoryConsumer {
    /// The consumer tag, broker-generated when none was requested.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Consumer for MemoryConsumer {
    type Delivery = MemoryDelivery;

    async fn next_delivery(
        &mut self,
    ) -> Option<Result<MemoryDelivery, TransportError>> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        let delivery = self.receiver.recv().await?;
        // Anything still buffered after a cancel has already been requeued.
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        Some(Ok(delivery))
    }
}

/// A message delivered by a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryDelivery {
    shared: Shared,
    consumer: u64,
    tag: u64,
    message: Message,
}

impl MemoryDelivery {
    /// The broker-assigned delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn settle(self, settlement: Settlement) -> Result<(), TransportError> {
        lock(&self.shared).settle(
            &self.shared,
            self.consumer,
            self.tag,
            settlement,
        )
    }
}

impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn content_type(&self) -> Option<&str> {
        self.message.content_type.as_deref()
    }

    fn routing_key(&self) -> &str {
        &self.message.routing_key
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self) -> Result<(), TransportError> {
        self.settle(Settlement::Ack)
    }

    async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        if requeue {
            self.settle(Settlement::Requeue)
        } else {
            self.settle(Settlement::Discard)
        }
    }
}
