//! Node configuration for the pub/sub fabric.
//!
//! A node's role decides which topology the bootstrap assembles; the base
//! port anchors every derived endpoint. The debug flag collapses the reaper
//! window and the maximum poll window to 100 ms so tests can exercise the
//! cap and reclamation paths in real time.

use std::fmt;
use std::time::Duration;

/// Maximum time one poll call may wait, and the reaper's idle window.
pub const DEFAULT_MAX_POLL_MILLIS: i64 = 600_000;

/// Collapsed window used when debug timeouts are enabled.
pub const DEBUG_MAX_POLL_MILLIS: i64 = 100;

/// Channel prefix routed to the configuration node on sharded deployments.
pub const DEFAULT_EVENTS_PREFIX: &str = "$events";

/// Which of the three bootstrap topologies this node assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Shard-serving node: peers publish directly to each other.
    Shard,
    /// Configuration node: relays routing-proxy traffic to every proxy.
    Config,
    /// Routing proxy: pushes to and subscribes at a configuration node.
    Proxy,
}

impl NodeRole {
    /// Role name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shard => "shard",
            Self::Config => "config",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer address, stored without scheme or port offsets applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPort {
    /// Host name or address.
    pub host: String,
    /// Base port of the peer process.
    pub port: u16,
}

impl HostPort {
    /// Build a peer address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything the bootstrap needs to assemble a node's topology.
///
/// # Examples
///
/// ```
/// use trellis_core::config::{FabricConfig, NodeRole};
///
/// let config = FabricConfig::new(NodeRole::Shard, 27017).with_debug_timeouts(true);
/// assert_eq!(config.max_poll_millis(), 100);
/// ```
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// This node's role.
    pub role: NodeRole,
    /// Base port the node's database listener uses; wire endpoints are
    /// derived from it.
    pub base_port: u16,
    /// Configuration nodes of the deployment. Routing proxies require at
    /// least one; shard nodes use them for the reserved events route and may
    /// leave the list empty on unsharded deployments.
    pub config_nodes: Vec<HostPort>,
    /// Collapse the reaper window and poll cap to 100 ms.
    pub debug_timeouts: bool,
    /// Channel prefixes forwarded to the configuration node from shard nodes.
    pub events_prefixes: Vec<String>,
}

impl FabricConfig {
    /// Configuration with defaults: no configuration nodes, production
    /// windows, the standard events prefix.
    pub fn new(role: NodeRole, base_port: u16) -> Self {
        Self {
            role,
            base_port,
            config_nodes: Vec::new(),
            debug_timeouts: false,
            events_prefixes: vec![DEFAULT_EVENTS_PREFIX.to_string()],
        }
    }

    /// Set the deployment's configuration nodes.
    pub fn with_config_nodes(mut self, nodes: Vec<HostPort>) -> Self {
        self.config_nodes = nodes;
        self
    }

    /// Enable or disable the collapsed debug windows.
    pub fn with_debug_timeouts(mut self, debug: bool) -> Self {
        self.debug_timeouts = debug;
        self
    }

    /// The system poll cap in milliseconds.
    pub fn max_poll_millis(&self) -> i64 {
        if self.debug_timeouts {
            DEBUG_MAX_POLL_MILLIS
        } else {
            DEFAULT_MAX_POLL_MILLIS
        }
    }

    /// The reaper's idle window; equal to the poll cap.
    pub fn reap_window(&self) -> Duration {
        Duration::from_millis(self.max_poll_millis() as u64)
    }

    /// The configuration node with the numerically largest port, the one
    /// both routing proxies and the events route attach to.
    pub fn preferred_config_node(&self) -> Option<&HostPort> {
        self.config_nodes.iter().max_by_key(|node| node.port)
    }
}
