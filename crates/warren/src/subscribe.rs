//! Consuming typed values from a queue.
//!
//! A subscription owns one channel and one consumer, and runs in its own
//! tokio task:
//!
//! ```text
//! Declaring ──► Consuming ──► StreamClosed   (channel or connection gone)
//!                   │
//!                   └──────► Cancelled      (Subscription::cancel)
//! ```
//!
//! Each delivery is decoded, handed to the handler, and resolved with the
//! handler's [`Verdict`]. Handlers of one subscription never run
//! concurrently, so a slow handler holds back acknowledgments and the
//! prefetch limit pushes back on the broker.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warren_codec::{BincodeCodec, Codec, JsonCodec};
use warren_transport::{Channel, ConsumeOptions, Connection, Consumer, Delivery};

use crate::config::{DecodeFailurePolicy, SubscribeOptions};
use crate::topology::{Binding, QueuePolicy, close_quietly, declare_binding};
use crate::PubSubError;

// ---------------------------------------------------------------------------
// Verdict / Handler
// ---------------------------------------------------------------------------

/// How a handled message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Acknowledge; the broker forgets the message.
    Accept,
    /// Reject without requeue; the message is dead-lettered or dropped.
    RejectDiscard,
    /// Reject and put the message back on the queue.
    RejectRequeue,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::RejectDiscard => f.write_str("reject-discard"),
            Self::RejectRequeue => f.write_str("reject-requeue"),
        }
    }
}

/// Processes one decoded message and decides its fate.
///
/// Implemented for any `FnMut(T) -> Verdict`, so a closure is usually
/// enough:
///
/// ```rust
/// use warren::{Handler, Verdict};
///
/// fn assert_handler<T, H: Handler<T>>(_: &H) {}
///
/// let handler = |turns: u32| {
///     if turns > 0 {
///         Verdict::Accept
///     } else {
///         Verdict::RejectDiscard
///     }
/// };
/// assert_handler(&handler);
/// ```
pub trait Handler<T>: Send + 'static {
    fn handle(&mut self, value: T) -> Verdict;
}

impl<T, F> Handler<T> for F
where
    F: FnMut(T) -> Verdict + Send + 'static,
{
    fn handle(&mut self, value: T) -> Verdict {
        self(value)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Why a subscription's task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionExit {
    /// The delivery stream ended: the channel or connection closed, the
    /// broker cancelled the consumer, or the stream reported an error.
    StreamClosed,
    /// [`Subscription::cancel`] was called.
    Cancelled,
}

/// Handle to a running subscription.
///
/// Dropping the handle detaches the task; it keeps consuming until its
/// stream ends.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<SubscriptionExit>,
}

impl Subscription {
    /// The queue this subscription consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the task has already ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the task to stop after the delivery in progress, then waits
    /// for it. The channel is closed, so unacknowledged deliveries go
    /// back to the queue.
    pub async fn cancel(mut self) -> SubscriptionExit {
        if let Some(stop) = self.stop.take() {
            // Err means the task already ended; join reports how.
            let _ = stop.send(());
        }
        self.join().await
    }

    /// Waits for the task to end on its own.
    pub async fn join(self) -> SubscriptionExit {
        // Keep the stop sender alive so waiting does not look like a detach.
        let _stop = self.stop;
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "subscription task failed");
                SubscriptionExit::StreamClosed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// subscribe
// ---------------------------------------------------------------------------

/// Subscribes `handler` to `binding.queue` with default options.
///
/// See [`subscribe_with`].
pub async fn subscribe<C, K, T, H>(
    conn: &C,
    binding: &Binding,
    codec: K,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    subscribe_with(conn, binding, codec, &SubscribeOptions::default(), handler).await
}

/// Subscribes to a queue whose messages are JSON.
pub async fn subscribe_json<C, T, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    policy: QueuePolicy,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let binding = Binding::new(exchange, queue_name, routing_key, policy);
    subscribe(conn, &binding, JsonCodec, handler).await
}

/// Subscribes to a queue whose messages are bincode.
pub async fn subscribe_bincode<C, T, H>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    policy: QueuePolicy,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let binding = Binding::new(exchange, queue_name, routing_key, policy);
    subscribe(conn, &binding, BincodeCodec, handler).await
}

/// Declares and binds the queue, then consumes it in a background task.
///
/// Returns once the consumer is registered; processing continues until
/// the stream ends or the returned [`Subscription`] is cancelled.
///
/// # Errors
/// Everything [`declare_binding`] returns, plus
/// [`PubSubError::ConsumeFailed`] if the prefetch limit cannot be set or
/// the consumer cannot be started. No task is spawned on error.
pub async fn subscribe_with<C, K, T, H>(
    conn: &C,
    binding: &Binding,
    codec: K,
    options: &SubscribeOptions,
    handler: H,
) -> Result<Subscription, PubSubError>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let options = options.clone().validated();
    let (channel, _) = declare_binding(conn, binding, &options.dead_letter_exchange).await?;

    if let Err(source) = channel.set_prefetch(options.prefetch_count).await {
        close_quietly(&channel).await;
        return Err(PubSubError::ConsumeFailed {
            queue: binding.queue.clone(),
            source,
        });
    }

    let consume_options = ConsumeOptions {
        consumer_tag: options.consumer_tag.clone(),
        ..Default::default()
    };
    let consumer = match channel.consume(&binding.queue, &consume_options).await {
        Ok(consumer) => consumer,
        Err(source) => {
            close_quietly(&channel).await;
            return Err(PubSubError::ConsumeFailed {
                queue: binding.queue.clone(),
                source,
            });
        }
    };

    info!(
        queue = %binding.queue,
        codec = codec.name(),
        prefetch = options.prefetch_count,
        "subscription started"
    );

    let (stop_tx, stop_rx) = oneshot::channel();
    let worker = Worker {
        queue: binding.queue.clone(),
        codec,
        handler,
        options,
        _message: std::marker::PhantomData,
    };
    let task = tokio::spawn(worker.run(channel, consumer, stop_rx));

    Ok(Subscription {
        queue: binding.queue.clone(),
        stop: Some(stop_tx),
        task,
    })
}

// ---------------------------------------------------------------------------
// Worker task
// ---------------------------------------------------------------------------

struct Worker<K, T, H> {
    queue: String,
    codec: K,
    handler: H,
    options: SubscribeOptions,
    _message: std::marker::PhantomData<fn() -> T>,
}

impl<K, T, H> Worker<K, T, H>
where
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn run<Ch: Channel>(
        mut self,
        channel: Ch,
        mut consumer: Ch::Consumer,
        mut stop: oneshot::Receiver<()>,
    ) -> SubscriptionExit {
        let mut detached = false;

        let exit = loop {
            let next = tokio::select! {
                biased;
                signal = &mut stop, if !detached => match signal {
                    Ok(()) => break SubscriptionExit::Cancelled,
                    Err(_) => {
                        // Handle dropped: keep running until the stream ends.
                        detached = true;
                        continue;
                    }
                },
                next = consumer.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "delivery stream failed");
                    break SubscriptionExit::StreamClosed;
                }
                None => break SubscriptionExit::StreamClosed,
            }
        };

        close_quietly(&channel).await;
        info!(queue = %self.queue, ?exit, "subscription stopped");
        exit
    }

    async fn process<D: Delivery>(&mut self, delivery: D) {
        let value: T = match self.codec.decode(delivery.body()) {
            Ok(value) => value,
            Err(e) => {
                let err = PubSubError::DecodingFailed(e);
                warn!(
                    queue = %self.queue,
                    routing_key = delivery.routing_key(),
                    policy = ?self.options.decode_failure,
                    error = %err,
                    "undecodable message"
                );
                let requeue = match self.options.decode_failure {
                    DecodeFailurePolicy::Skip => return,
                    DecodeFailurePolicy::Discard => false,
                    DecodeFailurePolicy::Requeue => true,
                };
                if let Err(e) = delivery.nack(requeue).await {
                    warn!(queue = %self.queue, error = %e, "failed to reject undecodable message");
                }
                return;
            }
        };

        let handler = &mut self.handler;
        let verdict = match catch_unwind(AssertUnwindSafe(|| handler.handle(value))) {
            Ok(verdict) => verdict,
            Err(panic) => {
                error!(
                    queue = %self.queue,
                    panic = panic_message(panic.as_ref()),
                    verdict = %self.options.panic_verdict,
                    "handler panicked"
                );
                self.options.panic_verdict
            }
        };

        resolve(&self.queue, delivery, verdict).await;
    }
}

async fn resolve<D: Delivery>(queue: &str, delivery: D, verdict: Verdict) {
    let routing_key = delivery.routing_key().to_string();
    let result = match verdict {
        Verdict::Accept => delivery.ack().await,
        Verdict::RejectDiscard => delivery.nack(false).await,
        Verdict::RejectRequeue => delivery.nack(true).await,
    };

    match result {
        Ok(()) => debug!(queue, %routing_key, %verdict, "message resolved"),
        Err(e) => warn!(
            queue,
            %routing_key,
            %verdict,
            error = %e,
            "failed to resolve message"
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accept.to_string(), "accept");
        assert_eq!(Verdict::RejectDiscard.to_string(), "reject-discard");
        assert_eq!(Verdict::RejectRequeue.to_string(), "reject-requeue");
    }

    #[test]
    fn test_closure_is_a_handler() {
        let mut handler = |n: i32| {
            if n < 0 {
                Verdict::RejectDiscard
            } else {
                Verdict::Accept
            }
        };
        assert_eq!(Handler::handle(&mut handler, 2), Verdict::Accept);
        assert_eq!(Handler::handle(&mut handler, -1), Verdict::RejectDiscard);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload = catch_unwind(|| panic!("bad move")).expect_err("should panic");
        assert_eq!(panic_message(payload.as_ref()), "bad move");

        let payload =
            catch_unwind(|| panic!("{} units lost", 3)).expect_err("should panic");
        assert_eq!(panic_message(payload.as_ref()), "3 units lost");
    }
}
