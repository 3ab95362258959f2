//! Multi-subscription long-poll engine.
//!
//! A poll leases every requested subscription, waits for traffic in bounded
//! ticks, and drains whatever arrived into one ordered batch. Between ticks
//! it watches for out-of-band cancellation (`should_unsub`), the client's
//! timeout, and the system-wide poll cap. The registry mutex is never held
//! across a wait; leases are what keep the sockets exclusive.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::id::SubscriptionId;
use crate::message::SubscriptionMessage;
use crate::registry::{SubscriptionError, SubscriptionRecord, SubscriptionRegistry};
use crate::transport::{self, PollItem};
use crate::wire::MessageFrames;

/// Bounded wait granularity inside the poll loop, in milliseconds.
pub const POLL_TICK_MILLIS: i64 = 100;

/// Everything one poll call produced.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Harvested messages; pop order is (id ascending, channel ascending,
    /// newest first).
    pub messages: BinaryHeap<SubscriptionMessage>,
    /// Milliseconds actually spent waiting.
    pub millis_polled: u64,
    /// Set iff the system cap elapsed without any message arriving; the
    /// client should simply poll again.
    pub poll_again: bool,
    /// Per-subscription failures; never aborts the other subscriptions.
    pub errors: BTreeMap<SubscriptionId, SubscriptionError>,
}

/// Poll `ids` for up to `timeout_millis`.
///
/// A timeout of zero or less drains without waiting. Waits never exceed
/// `cap_millis` regardless of the client's timeout.
pub fn poll(
    registry: &SubscriptionRegistry,
    ids: &BTreeSet<SubscriptionId>,
    timeout_millis: i64,
    cap_millis: i64,
) -> PollOutcome {
    let mut outcome = PollOutcome::default();

    // Acquire leases. Checkout failures are reported per id and hold nothing.
    let mut leased: Vec<(SubscriptionId, Arc<SubscriptionRecord>)> = Vec::new();
    for &id in ids {
        match registry.checkout(id) {
            Ok(record) => leased.push((id, record)),
            Err(err) => {
                outcome.errors.insert(id, err);
            }
        }
    }
    if leased.is_empty() {
        return outcome;
    }

    let mut remaining = timeout_millis.min(cap_millis);
    let mut elapsed: i64 = 0;

    while remaining > 0 {
        let tick = remaining.min(POLL_TICK_MILLIS);

        let any_readable = {
            let guards: Vec<_> = leased.iter().map(|(_, record)| record.socket().lock()).collect();
            let mut items: Vec<PollItem<'_>> = guards.iter().map(|socket| socket.poll_item()).collect();
            match transport::wait(&mut items, tick) {
                Ok(ready) => ready > 0,
                Err(err) => {
                    warn!(error = %err, "bounded wait failed; ending poll");
                    for (id, _) in &leased {
                        outcome
                            .errors
                            .insert(*id, SubscriptionError::Transport(err.to_string()));
                    }
                    drop(items);
                    drop(guards);
                    release(registry, &leased);
                    outcome.millis_polled = elapsed as u64;
                    return outcome;
                }
            }
        };
        if any_readable {
            break;
        }

        // Between ticks: honor unsubscribes issued while we were waiting.
        let mut index = 0;
        while index < leased.len() {
            if leased[index].1.unsubscribe_requested() {
                let (id, record) = leased.remove(index);
                outcome.errors.insert(id, SubscriptionError::Interrupted);
                // Our lease reference goes first so the registry drop is the
                // last one and actually closes the socket.
                drop(record);
                registry.remove(id, true);
            } else {
                index += 1;
            }
        }
        if leased.is_empty() {
            outcome.millis_polled = (elapsed + tick) as u64;
            return outcome;
        }

        elapsed += tick;
        remaining -= tick;

        if elapsed >= cap_millis {
            outcome.poll_again = true;
            release(registry, &leased);
            outcome.millis_polled = elapsed as u64;
            return outcome;
        }
    }

    // Drain every leased socket without blocking; sockets with nothing queued
    // fall straight through.
    for (id, record) in &leased {
        drain(*id, record, &mut outcome.messages, &mut outcome.errors);
    }

    release(registry, &leased);
    outcome.millis_polled = elapsed as u64;
    outcome
}

fn release(registry: &SubscriptionRegistry, leased: &[(SubscriptionId, Arc<SubscriptionRecord>)]) {
    for (_, record) in leased {
        registry.checkin(record);
    }
}

fn drain(
    id: SubscriptionId,
    record: &SubscriptionRecord,
    messages: &mut BinaryHeap<SubscriptionMessage>,
    errors: &mut BTreeMap<SubscriptionId, SubscriptionError>,
) {
    let socket = record.socket().lock();
    loop {
        let channel_frame = match socket.recv_nowait() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                errors.insert(id, SubscriptionError::Transport(err.to_string()));
                return;
            }
        };
        // The remaining frames of a multipart message are delivered
        // atomically with the first, so these reads cannot stall.
        let payload_frame = match socket.recv() {
            Ok(frame) => frame,
            Err(err) => {
                errors.insert(id, SubscriptionError::Transport(err.to_string()));
                return;
            }
        };
        let stamp_frame = match socket.recv() {
            Ok(frame) => frame,
            Err(err) => {
                errors.insert(id, SubscriptionError::Transport(err.to_string()));
                return;
            }
        };

        let frames = match MessageFrames::decode(&channel_frame, &payload_frame, &stamp_frame) {
            Ok(frames) => frames,
            Err(err) => {
                errors.insert(id, SubscriptionError::Malformed(err.to_string()));
                continue;
            }
        };
        let document: Value = match serde_json::from_slice(frames.payload()) {
            Ok(document) => document,
            Err(err) => {
                errors.insert(id, SubscriptionError::Malformed(err.to_string()));
                continue;
            }
        };

        if let Some(filter) = record.filter() {
            if !filter.matches(&document) {
                continue;
            }
        }
        let document = match record.projection() {
            Some(projection) => projection.apply(&document),
            None => document,
        };

        messages.push(SubscriptionMessage::new(
            id,
            String::from_utf8_lossy(frames.channel()).into_owned(),
            document,
            frames.sent_at_micros(),
        ));
    }
}
