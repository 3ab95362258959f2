//! Messages harvested for a single poll response.
//!
//! The poll engine pushes every harvested message into a `BinaryHeap`; the
//! ordering below makes the heap pop them grouped by subscription id
//! (ascending), then by channel (ascending), newest-first within a channel,
//! which is exactly the shape the response serializer wants to walk.

use std::cmp::Ordering;

use serde_json::Value;

use crate::id::SubscriptionId;

/// One message delivered to one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionMessage {
    /// Subscription this message was harvested for.
    pub subscription_id: SubscriptionId,
    /// Channel the publisher named.
    pub channel: String,
    /// Payload document, already filtered and projected.
    pub message: Value,
    /// Publisher's send timestamp, microseconds since the Unix epoch.
    pub sent_at_micros: u64,
}

impl SubscriptionMessage {
    /// Assemble a harvested message.
    pub fn new(
        subscription_id: SubscriptionId,
        channel: String,
        message: Value,
        sent_at_micros: u64,
    ) -> Self {
        Self {
            subscription_id,
            channel,
            message,
            sent_at_micros,
        }
    }

    fn priority_key(&self) -> (&SubscriptionId, &str, u64) {
        (&self.subscription_id, &self.channel, self.sent_at_micros)
    }
}

// Ordering (and equality, to stay consistent with it) is on the grouping key
// only; payloads do not participate. `BinaryHeap` is a max-heap, so the
// comparison runs id and channel in reverse: the heap's maximum is the lowest
// id, then the lowest channel, then the newest timestamp.
impl Ord for SubscriptionMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .subscription_id
            .cmp(&self.subscription_id)
            .then_with(|| other.channel.cmp(&self.channel))
            .then_with(|| self.sent_at_micros.cmp(&other.sent_at_micros))
    }
}

impl PartialOrd for SubscriptionMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SubscriptionMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority_key() == other.priority_key()
    }
}

impl Eq for SubscriptionMessage {}
