//! The node-wide pub/sub engine handle.
//!
//! A [`Fabric`] owns the assembled topology, the subscription registry and
//! the reaper; client-handler threads share one instance and drive the four
//! operations (publish, subscribe, poll, unsubscribe) plus introspection and
//! peer churn. Bootstrap failures disable pub/sub on the node instead of
//! failing it: publishes report false, subscribes report
//! [`FabricError::Disabled`], and the surrounding server keeps running.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{FabricConfig, HostPort, NodeRole};
use crate::endpoint;
use crate::error::FabricError;
use crate::id::SubscriptionId;
use crate::matcher::{DocumentFilter, Projection};
use crate::poll::{self, PollOutcome};
use crate::publish::Publisher;
use crate::reaper::Reaper;
use crate::registry::{
    RemoveOutcome, SubscriptionError, SubscriptionInfo, SubscriptionRecord, SubscriptionRegistry,
};
use crate::topology;
use crate::transport::{Context, SocketKind};

/// The pub/sub fabric embedded in one database node.
pub struct Fabric {
    context: Context,
    registry: Arc<SubscriptionRegistry>,
    publisher: Option<Publisher>,
    role: NodeRole,
    max_poll_millis: i64,
    _reaper: Option<Reaper>,
}

impl Fabric {
    /// Assemble the node's topology and start its background threads.
    ///
    /// Never fails: when the topology cannot be assembled the error is logged
    /// and the returned fabric is inert, so the host server keeps serving.
    pub fn bootstrap(config: FabricConfig) -> Self {
        let context = Context::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let max_poll_millis = config.max_poll_millis();

        let (publisher, reaper) = match Self::assemble(&context, &registry, &config) {
            Ok(parts) => parts,
            Err(err) => {
                error!(role = %config.role, error = %err, "could not initialize pubsub; disabling it on this node");
                (None, None)
            }
        };

        Self {
            context,
            registry,
            publisher,
            role: config.role,
            max_poll_millis,
            _reaper: reaper,
        }
    }

    fn assemble(
        context: &Context,
        registry: &Arc<SubscriptionRegistry>,
        config: &FabricConfig,
    ) -> Result<(Option<Publisher>, Option<Reaper>), FabricError> {
        let topology = topology::assemble(context, config)?;
        let reaper = if topology.serves_subscribers {
            let reaper = Reaper::spawn(Arc::clone(registry), config.reap_window())
                .map_err(|source| FabricError::Thread {
                    name: "pubsub-reaper",
                    source,
                })?;
            Some(reaper)
        } else {
            None
        };
        info!(role = %config.role, port = config.base_port, "pubsub initialized");
        Ok((Some(topology.publisher), reaper))
    }

    /// Whether the bootstrap succeeded and the node participates in pub/sub.
    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    /// Publish `message` on `channel`, deployment-wide, best effort.
    ///
    /// Returns false when the transport cannot accept the frame (or pub/sub
    /// is disabled); never raises.
    pub fn publish(&self, channel: &str, message: &Value) -> bool {
        let Some(publisher) = &self.publisher else {
            warn!(channel, "dropping publication: pubsub is disabled");
            return false;
        };
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(channel, error = %err, "could not serialize publication payload");
                return false;
            }
        };
        publisher.publish(channel.as_bytes(), &payload)
    }

    /// Create a subscription on `channel` (a byte-prefix topic filter),
    /// optionally compiling a match predicate and a projection for it.
    pub fn subscribe(
        &self,
        channel: &str,
        filter: Option<&Value>,
        projection: Option<&Value>,
    ) -> Result<SubscriptionId, FabricError> {
        if self.publisher.is_none() {
            return Err(FabricError::Disabled);
        }
        let filter = filter.map(DocumentFilter::compile).transpose()?;
        let projection = projection.map(Projection::compile).transpose()?;

        let socket = self
            .context
            .socket(SocketKind::Sub)
            .map_err(FabricError::Subscribe)?;
        socket
            .connect(endpoint::INPROC_PUBSUB)
            .map_err(FabricError::Subscribe)?;
        socket
            .set_subscribe(channel.as_bytes())
            .map_err(FabricError::Subscribe)?;

        let id = SubscriptionId::mint();
        let record = SubscriptionRecord::new(socket, channel.as_bytes().to_vec(), filter, projection);
        if self.registry.insert(id, record).is_err() {
            return Err(FabricError::IdCollision);
        }
        Ok(id)
    }

    /// Long-poll the given subscriptions for up to `timeout_millis`.
    pub fn poll(&self, ids: &BTreeSet<SubscriptionId>, timeout_millis: i64) -> PollOutcome {
        poll::poll(&self.registry, ids, timeout_millis, self.max_poll_millis)
    }

    /// Drop subscriptions. Ids whose poll is in flight are destroyed by that
    /// poll; unknown ids are reported in the returned error map.
    pub fn unsubscribe(
        &self,
        ids: &BTreeSet<SubscriptionId>,
    ) -> BTreeMap<SubscriptionId, SubscriptionError> {
        let mut errors = BTreeMap::new();
        for &id in ids {
            match self.registry.remove(id, false) {
                RemoveOutcome::Removed | RemoveOutcome::Deferred => {}
                RemoveOutcome::NotFound => {
                    errors.insert(id, SubscriptionError::NotFound);
                }
            }
        }
        errors
    }

    /// Snapshot of every live subscription, for introspection.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.snapshot()
    }

    /// A topology scan observed `peer`; connect the outbound socket to it.
    /// Shard nodes only; a no-op elsewhere (and when pub/sub is disabled).
    pub fn peer_joined(&self, peer: HostPort) {
        if self.role != NodeRole::Shard {
            return;
        }
        if let Some(publisher) = &self.publisher {
            publisher.peer_joined(peer);
        }
    }

    /// A topology scan finished; prune peers it did not observe.
    /// Shard nodes only, like [`peer_joined`](Fabric::peer_joined).
    pub fn peer_scan_complete(&self) {
        if self.role != NodeRole::Shard {
            return;
        }
        if let Some(publisher) = &self.publisher {
            publisher.peer_scan_complete();
        }
    }

    /// The system poll cap this node enforces, in milliseconds.
    pub fn max_poll_millis(&self) -> i64 {
        self.max_poll_millis
    }
}
