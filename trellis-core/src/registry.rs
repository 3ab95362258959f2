//! Process-wide subscription registry.
//!
//! One mutex guards the id -> record map; every create/find/erase transition
//! holds it briefly and performs no I/O under it. Each record's SUB socket is
//! read by at most one thread at a time, enforced by the `in_use` lease:
//! `checkout` grants it, `checkin` returns it, and `remove` either destroys
//! the record outright or defers destruction behind `should_unsub` while a
//! poll still holds the lease.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::id::SubscriptionId;
use crate::matcher::{DocumentFilter, Projection};
use crate::transport::Socket;

/// Per-subscription error, reported to the caller keyed by id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The id is unknown (or its destruction is already pending).
    #[error("Subscription not found.")]
    NotFound,
    /// Another poll currently holds the lease.
    #[error("Poll currently active.")]
    PollActive,
    /// An unsubscribe cancelled the poll mid-wait.
    #[error("Poll interrupted by unsubscribe.")]
    Interrupted,
    /// The transport failed while waiting on or draining the socket.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A received message did not follow the wire layout.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Outcome of [`SubscriptionRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The record was destroyed and its socket closed.
    Removed,
    /// A poll holds the lease; destruction is deferred to the poll loop.
    Deferred,
    /// No record with that id.
    NotFound,
}

/// One live subscription.
pub struct SubscriptionRecord {
    // Manual Debug impl below: `Socket` has no Debug impl, so it can't be derived.
    // Exclusive read access is the lease-holder's; the mutex exists so the
    // registry can be shared across threads at all.
    socket: Mutex<Socket>,
    channel: Bytes,
    in_use: AtomicBool,
    should_unsub: AtomicBool,
    polled_recently: AtomicBool,
    filter: Option<DocumentFilter>,
    projection: Option<Projection>,
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("channel", &self.channel)
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .field("should_unsub", &self.should_unsub.load(Ordering::Relaxed))
            .field(
                "polled_recently",
                &self.polled_recently.load(Ordering::Relaxed),
            )
            .field("filter", &self.filter)
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}

impl SubscriptionRecord {
    /// Wrap a connected SUB socket into a fresh record.
    ///
    /// New records count as recently polled so the reaper grants them a full
    /// idle window before reclaiming them.
    pub fn new(
        socket: Socket,
        channel: impl Into<Bytes>,
        filter: Option<DocumentFilter>,
        projection: Option<Projection>,
    ) -> Self {
        Self {
            socket: Mutex::new(socket),
            channel: channel.into(),
            in_use: AtomicBool::new(false),
            should_unsub: AtomicBool::new(false),
            polled_recently: AtomicBool::new(true),
            filter,
            projection,
        }
    }

    /// The subscription's inbound socket.
    pub fn socket(&self) -> &Mutex<Socket> {
        &self.socket
    }

    /// Channel prefix this subscription was created with.
    pub fn channel(&self) -> &Bytes {
        &self.channel
    }

    /// Compiled match predicate, if any.
    pub fn filter(&self) -> Option<&DocumentFilter> {
        self.filter.as_ref()
    }

    /// Compiled projection, if any.
    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    /// Whether an unsubscribe is waiting for the current poll to notice.
    pub fn unsubscribe_requested(&self) -> bool {
        self.should_unsub.load(Ordering::SeqCst)
    }
}

/// Introspection snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Channel prefix, lossily decoded for display.
    pub channel: String,
    /// Whether a poll currently holds the lease.
    pub in_use: bool,
    /// Whether the subscription was touched since the last reaper sweep.
    pub polled_recently: bool,
    /// Whether destruction is pending behind an active poll.
    pub unsubscribe_pending: bool,
}

/// The process-wide id -> record map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<BTreeMap<SubscriptionId, Arc<SubscriptionRecord>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record under a freshly minted id.
    ///
    /// Fails if the id is already present; collisions are vanishingly
    /// unlikely but checked.
    pub fn insert(&self, id: SubscriptionId, record: SubscriptionRecord) -> Result<(), SubscriptionRecord> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(&id) {
            return Err(record);
        }
        subscriptions.insert(id, Arc::new(record));
        Ok(())
    }

    /// Acquire the exclusive poll lease on `id`.
    ///
    /// Ids that are unknown or pending destruction report
    /// [`SubscriptionError::NotFound`]; ids whose lease is already held
    /// report [`SubscriptionError::PollActive`].
    pub fn checkout(
        &self,
        id: SubscriptionId,
    ) -> Result<Arc<SubscriptionRecord>, SubscriptionError> {
        let subscriptions = self.subscriptions.lock();
        let record = subscriptions.get(&id).ok_or(SubscriptionError::NotFound)?;
        if record.should_unsub.load(Ordering::SeqCst) {
            return Err(SubscriptionError::NotFound);
        }
        if record.in_use.load(Ordering::SeqCst) {
            return Err(SubscriptionError::PollActive);
        }
        record.in_use.store(true, Ordering::SeqCst);
        record.polled_recently.store(true, Ordering::SeqCst);
        Ok(Arc::clone(record))
    }

    /// Return the lease, marking the subscription live for the reaper.
    pub fn checkin(&self, record: &SubscriptionRecord) {
        let _serialize = self.subscriptions.lock();
        record.polled_recently.store(true, Ordering::SeqCst);
        record.in_use.store(false, Ordering::SeqCst);
    }

    /// Remove `id`, deferring when a poll holds the lease and `force` is not
    /// set. Destruction drops the record, which closes its socket.
    pub fn remove(&self, id: SubscriptionId, force: bool) -> RemoveOutcome {
        let mut subscriptions = self.subscriptions.lock();
        let Some(record) = subscriptions.get(&id) else {
            return RemoveOutcome::NotFound;
        };
        if record.in_use.load(Ordering::SeqCst) && !force {
            record.should_unsub.store(true, Ordering::SeqCst);
            return RemoveOutcome::Deferred;
        }
        subscriptions.remove(&id);
        RemoveOutcome::Removed
    }

    /// One reaper pass: clear every liveness bit that is set, reclaim every
    /// record whose bit was already clear. Leased records are never touched.
    /// Returns the number of records reclaimed.
    pub fn sweep_idle(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|_, record| {
            if record.in_use.load(Ordering::SeqCst) {
                return true;
            }
            record.polled_recently.swap(false, Ordering::SeqCst)
        });
        before - subscriptions.len()
    }

    /// Snapshot every entry for introspection.
    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let subscriptions = self.subscriptions.lock();
        subscriptions
            .iter()
            .map(|(id, record)| SubscriptionInfo {
                id: *id,
                channel: String::from_utf8_lossy(record.channel()).into_owned(),
                in_use: record.in_use.load(Ordering::SeqCst),
                polled_recently: record.polled_recently.load(Ordering::SeqCst),
                unsubscribe_pending: record.should_unsub.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}
