//! Subscription configuration.

use tracing::warn;

use crate::subscribe::Verdict;
use crate::topology::DEFAULT_DEAD_LETTER_EXCHANGE;

/// What a subscription does with a delivery it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Leave the delivery unresolved. It stays unacknowledged, holding a
    /// prefetch slot, until the channel closes.
    Skip,
    /// Reject without requeue, sending it to the dead-letter exchange.
    #[default]
    Discard,
    /// Reject with requeue. A payload that never decodes will loop.
    Requeue,
}

/// Options for [`subscribe_with`](crate::subscribe::subscribe_with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Unacknowledged deliveries the broker may push ahead. Must be
    /// non-zero; `validated` replaces 0 with [`Self::DEFAULT_PREFETCH`].
    pub prefetch_count: u16,
    /// Exchange named in the queue's dead-letter argument. Empty = none.
    pub dead_letter_exchange: String,
    /// Consumer tag. Empty lets the broker generate one.
    pub consumer_tag: String,
    /// Handling of undecodable deliveries.
    pub decode_failure: DecodeFailurePolicy,
    /// Verdict applied when the handler panics.
    pub panic_verdict: Verdict,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: Self::DEFAULT_PREFETCH,
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            consumer_tag: String::new(),
            decode_failure: DecodeFailurePolicy::default(),
            panic_verdict: Verdict::RejectDiscard,
        }
    }
}

impl SubscribeOptions {
    pub const DEFAULT_PREFETCH: u16 = 10;

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    pub fn with_panic_verdict(mut self, verdict: Verdict) -> Self {
        self.panic_verdict = verdict;
        self
    }

    /// Fix values that would make the subscription unsafe.
    ///
    /// Called by `subscribe_with`. A `prefetch_count` of 0 would let the
    /// broker push an unbounded backlog, so it becomes
    /// [`Self::DEFAULT_PREFETCH`]. A `panic_verdict` of [`Verdict::Accept`]
    /// would acknowledge messages whose handler crashed, so it is reset to
    /// [`Verdict::RejectDiscard`].
    pub fn validated(mut self) -> Self {
        if self.prefetch_count == 0 {
            warn!(
                default = Self::DEFAULT_PREFETCH,
                "prefetch_count 0 is unbounded; using default"
            );
            self.prefetch_count = Self::DEFAULT_PREFETCH;
        }
        if self.panic_verdict == Verdict::Accept {
            warn!(
                verdict = %self.panic_verdict,
                "panic_verdict may not accept; using reject-discard"
            );
            self.panic_verdict = Verdict::RejectDiscard;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SubscribeOptions::default();
        assert_eq!(options.prefetch_count, 10);
        assert_eq!(options.dead_letter_exchange, "peril_dlx");
        assert!(options.consumer_tag.is_empty());
        assert_eq!(options.decode_failure, DecodeFailurePolicy::Discard);
        assert_eq!(options.panic_verdict, Verdict::RejectDiscard);
    }

    #[test]
    fn test_builders() {
        let options = SubscribeOptions::default()
            .with_prefetch(1)
            .with_dead_letter_exchange("other_dlx")
            .with_consumer_tag("server")
            .with_decode_failure(DecodeFailurePolicy::Requeue)
            .with_panic_verdict(Verdict::RejectRequeue);
        assert_eq!(options.prefetch_count, 1);
        assert_eq!(options.dead_letter_exchange, "other_dlx");
        assert_eq!(options.consumer_tag, "server");
        assert_eq!(options.decode_failure, DecodeFailurePolicy::Requeue);
        assert_eq!(options.panic_verdict, Verdict::RejectRequeue);
    }

    #[test]
    fn test_validated_rejects_accept_on_panic() {
        let options = SubscribeOptions::default()
            .with_panic_verdict(Verdict::Accept)
            .validated();
        assert_eq!(options.panic_verdict, Verdict::RejectDiscard);
    }

    #[test]
    fn test_validated_keeps_requeue_on_panic() {
        let options = SubscribeOptions::default()
            .with_panic_verdict(Verdict::RejectRequeue)
            .validated();
        assert_eq!(options.panic_verdict, Verdict::RejectRequeue);
    }

    #[test]
    fn test_validated_bounds_zero_prefetch() {
        let options = SubscribeOptions::default().with_prefetch(0).validated();
        assert_eq!(options.prefetch_count, SubscribeOptions::DEFAULT_PREFETCH);
    }

    #[test]
    fn test_validated_keeps_explicit_prefetch() {
        let options = SubscribeOptions::default().with_prefetch(1).validated();
        assert_eq!(options.prefetch_count, 1);
    }
}
