//! Per-role topology bootstrap.
//!
//! Exactly one of three socket arrangements is assembled at process start:
//!
//! - **Shard node**: PUB out to every peer, SUB in on base+1234 (connected to
//!   itself so local publications loop back), proxy thread SUB -> inproc PUB.
//! - **Configuration node**: PULL in on base+1234, PUB out on base+2345,
//!   proxy thread PULL -> PUB; local publications enter its own PULL queue.
//! - **Routing proxy**: PUSH up to the configuration node's queue, SUB down
//!   from its fan-out, proxy thread SUB -> inproc PUB.
//!
//! Whatever the role, subscribers in the process connect to
//! [`endpoint::INPROC_PUBSUB`] and see every frame the node ingests, and
//! publishers hand frames to a single outbound socket whose reach is the
//! whole deployment.

use std::thread;

use tracing::{error, info};

use crate::config::{FabricConfig, NodeRole};
use crate::endpoint;
use crate::error::FabricError;
use crate::publish::Publisher;
use crate::transport::{self, Context, Socket, SocketKind};

/// A node's assembled socket topology.
pub(crate) struct Topology {
    /// Send side handed to the fabric.
    pub publisher: Publisher,
    /// Whether this role fans ingested traffic out to local subscribers
    /// (and therefore needs the reaper).
    pub serves_subscribers: bool,
}

/// Assemble the topology for `config`, spawning the proxy thread.
pub(crate) fn assemble(context: &Context, config: &FabricConfig) -> Result<Topology, FabricError> {
    let inbound_port = endpoint::offset_port(config.base_port, endpoint::INBOUND_PORT_OFFSET)
        .ok_or_else(|| port_error(config.base_port))?;

    match config.role {
        NodeRole::Shard => {
            let inbound = context.socket(SocketKind::Sub)?;
            inbound.set_subscribe(b"")?;
            inbound.bind(&endpoint::tcp_wildcard(inbound_port))?;

            // Loop our own publications back through the inbound socket;
            // peers connect to it the same way when they join.
            let outbound = context.socket(SocketKind::Pub)?;
            outbound.connect(&endpoint::tcp("localhost", inbound_port))?;

            let events = events_route(context, config)?;

            spawn_proxy(context, inbound)?;

            info!(port = inbound_port, "pubsub listening for peer publications");
            Ok(Topology {
                publisher: Publisher::new(
                    outbound,
                    events,
                    config.events_prefixes.clone(),
                    config.base_port,
                ),
                serves_subscribers: true,
            })
        }
        NodeRole::Config => {
            let fanout_port = endpoint::offset_port(config.base_port, endpoint::FANOUT_PORT_OFFSET)
                .ok_or_else(|| port_error(config.base_port))?;

            // Routing proxies push into a queue shared between the
            // configuration nodes; whoever pulls a frame broadcasts it.
            let inbound = context.socket(SocketKind::Pull)?;
            inbound.bind(&endpoint::tcp_wildcard(inbound_port))?;

            let fanout = context.socket(SocketKind::Pub)?;
            fanout.bind(&endpoint::tcp_wildcard(fanout_port))?;

            spawn_relay(inbound, fanout)?;

            // The relay thread owns both bound sockets, so local publications
            // enter through the node's own queue like everyone else's.
            let outbound = context.socket(SocketKind::Push)?;
            outbound.connect(&endpoint::tcp("localhost", inbound_port))?;

            info!(
                pull = inbound_port,
                publish = fanout_port,
                "pubsub relaying routing-proxy publications"
            );
            Ok(Topology {
                publisher: Publisher::new(
                    outbound,
                    None,
                    config.events_prefixes.clone(),
                    config.base_port,
                ),
                serves_subscribers: false,
            })
        }
        NodeRole::Proxy => {
            let config_node = config.preferred_config_node().ok_or_else(|| {
                FabricError::Config(
                    "a routing proxy requires at least one configuration node".to_string(),
                )
            })?;
            let push_port = endpoint::offset_port(config_node.port, endpoint::INBOUND_PORT_OFFSET)
                .ok_or_else(|| port_error(config_node.port))?;
            let sub_port = endpoint::offset_port(config_node.port, endpoint::FANOUT_PORT_OFFSET)
                .ok_or_else(|| port_error(config_node.port))?;

            let outbound = context.socket(SocketKind::Push)?;
            outbound.connect(&endpoint::tcp(&config_node.host, push_port))?;

            let inbound = context.socket(SocketKind::Sub)?;
            inbound.set_subscribe(b"")?;
            inbound.connect(&endpoint::tcp(&config_node.host, sub_port))?;

            spawn_proxy(context, inbound)?;

            info!(config_node = %config_node, "pubsub attached to configuration node");
            Ok(Topology {
                publisher: Publisher::new(
                    outbound,
                    None,
                    config.events_prefixes.clone(),
                    config.base_port,
                ),
                serves_subscribers: true,
            })
        }
    }
}

/// On sharded deployments, shard nodes keep a dedicated PUSH to the
/// configuration node for reserved-prefix publications.
fn events_route(context: &Context, config: &FabricConfig) -> Result<Option<Socket>, FabricError> {
    let Some(config_node) = config.preferred_config_node() else {
        return Ok(None);
    };
    let port = endpoint::offset_port(config_node.port, endpoint::INBOUND_PORT_OFFSET)
        .ok_or_else(|| port_error(config_node.port))?;
    let events = context.socket(SocketKind::Push)?;
    events.connect(&endpoint::tcp(&config_node.host, port))?;
    Ok(Some(events))
}

/// Bind the local fan-out endpoint and forward everything `inbound` ingests
/// to it, on a dedicated thread.
fn spawn_proxy(context: &Context, inbound: Socket) -> Result<(), FabricError> {
    let internal = context.socket(SocketKind::Pub)?;
    internal.bind(endpoint::INPROC_PUBSUB)?;
    spawn_forwarder("pubsub-proxy", inbound, internal)
}

/// Configuration-node relay: forward the shared PULL queue to the fan-out PUB.
fn spawn_relay(inbound: Socket, fanout: Socket) -> Result<(), FabricError> {
    spawn_forwarder("pubsub-relay", inbound, fanout)
}

fn spawn_forwarder(name: &'static str, from: Socket, to: Socket) -> Result<(), FabricError> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(err) = transport::proxy(&from, &to) {
                error!(error = %err, "message forwarder terminated");
            }
        })
        .map(|_handle| ())
        .map_err(|source| FabricError::Thread { name, source })
}

fn port_error(base: u16) -> FabricError {
    FabricError::Config(format!("base port {base} leaves no room for port offsets"))
}
