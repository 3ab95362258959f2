//! Background reclamation of abandoned subscriptions.
//!
//! Clients that stop polling never say goodbye; the reaper sweeps the
//! registry once per idle window and reclaims every subscription no poll has
//! touched since the previous sweep. A subscription therefore survives as
//! long as something polls it at least once per window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::registry::SubscriptionRegistry;

// Upper bound on one shutdown-check sleep, so stopping the reaper never waits
// for a full production window.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Handle on the reaper thread; stops and joins it on drop.
pub struct Reaper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Launch the sweep thread with the given idle window.
    pub fn spawn(
        registry: Arc<SubscriptionRegistry>,
        window: Duration,
    ) -> Result<Self, std::io::Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("pubsub-reaper".to_string())
            .spawn(move || run(&registry, window, &flag))?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(registry: &SubscriptionRegistry, window: Duration, shutdown: &AtomicBool) {
    loop {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            thread::sleep(left.min(SLEEP_SLICE));
        }
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let reaped = registry.sweep_idle();
        if reaped > 0 {
            debug!(reaped, "reclaimed idle subscriptions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SubscriptionId;
    use crate::registry::{RemoveOutcome, SubscriptionRecord};
    use crate::transport::{Context, SocketKind};

    #[test]
    fn test_reaper_reclaims_idle_subscription() {
        let ctx = Context::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let id = SubscriptionId::mint();
        let socket = ctx.socket(SocketKind::Sub).unwrap();
        registry
            .insert(id, SubscriptionRecord::new(socket, &b"c"[..], None, None))
            .ok()
            .unwrap();

        let mut reaper = Reaper::spawn(Arc::clone(&registry), Duration::from_millis(50)).unwrap();

        // Two windows pass without a poll: the first sweep clears the
        // liveness bit, the second reclaims the record.
        thread::sleep(Duration::from_millis(250));
        assert_eq!(registry.remove(id, false), RemoveOutcome::NotFound);

        reaper.stop();
    }

    #[test]
    fn test_stop_joins_quickly() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut reaper = Reaper::spawn(registry, Duration::from_secs(600)).unwrap();
        let started = Instant::now();
        reaper.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
