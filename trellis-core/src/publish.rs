//! Outbound publish path and peer bookkeeping.
//!
//! One mutex serializes every touch of the send-side sockets: frame
//! serialization onto the outbound socket, the reserved-prefix forward to the
//! configuration node, and peer connect/disconnect churn. Publishing never
//! raises; the caller is often an internal event emitter whose writes must
//! not fail.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::HostPort;
use crate::endpoint;
use crate::transport::Socket;
use crate::wire::{now_micros, MessageFrames};

/// Liveness map over the peers the outbound socket is connected to.
///
/// Mark-and-sweep: the replication driver marks every peer it observes in a
/// topology scan, then one sweep disconnects whatever was not marked and
/// resets the remaining bits for the next scan.
#[derive(Debug, Default)]
pub struct PeerSet {
    members: BTreeMap<HostPort, bool>,
}

impl PeerSet {
    /// Mark `peer` alive; returns true when the peer is new to the set.
    pub fn mark_alive(&mut self, peer: HostPort) -> bool {
        match self.members.get_mut(&peer) {
            Some(alive) => {
                *alive = true;
                false
            }
            None => {
                self.members.insert(peer, true);
                true
            }
        }
    }

    /// Remove and return every unmarked peer, resetting the marks of the
    /// peers that stay.
    pub fn sweep(&mut self) -> Vec<HostPort> {
        let mut stale = Vec::new();
        self.members.retain(|peer, alive| {
            if *alive {
                *alive = false;
                true
            } else {
                stale.push(peer.clone());
                false
            }
        });
        stale
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether any peers are connected.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

struct SendState {
    outbound: Socket,
    /// PUSH to the configuration node; shard nodes on sharded deployments.
    events: Option<Socket>,
    peers: PeerSet,
}

/// The node's send side.
pub struct Publisher {
    state: Mutex<SendState>,
    events_prefixes: Vec<String>,
    own_port: u16,
}

impl Publisher {
    /// Wrap the bootstrap's outbound sockets.
    pub(crate) fn new(
        outbound: Socket,
        events: Option<Socket>,
        events_prefixes: Vec<String>,
        own_port: u16,
    ) -> Self {
        Self {
            state: Mutex::new(SendState {
                outbound,
                events,
                peers: PeerSet::default(),
            }),
            events_prefixes,
            own_port,
        }
    }

    /// Serialize one (channel, payload) frame onto the outbound socket,
    /// stamping the send time. Channels carrying a reserved prefix are
    /// additionally pushed to the configuration node inside the same
    /// critical section.
    ///
    /// Returns false on transport failure; never raises.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> bool {
        let frames = MessageFrames::new(channel.to_vec(), payload.to_vec(), now_micros());
        let [channel_frame, payload_frame, stamp_frame] = frames.encode();
        let wire: [&[u8]; 3] = [&channel_frame, &payload_frame, &stamp_frame];

        let state = self.state.lock();
        if let Err(err) = state.outbound.send_frames(&wire) {
            error!(error = %err, "failed to publish to outbound socket");
            return false;
        }
        if self.is_events_channel(channel) {
            if let Some(events) = &state.events {
                if let Err(err) = events.send_frames(&wire) {
                    error!(error = %err, "failed to forward event publication to configuration node");
                    return false;
                }
            }
        }
        true
    }

    fn is_events_channel(&self, channel: &[u8]) -> bool {
        self.events_prefixes
            .iter()
            .any(|prefix| channel.starts_with(prefix.as_bytes()))
    }

    /// Connect the outbound socket to a peer observed in a topology scan.
    ///
    /// Already-known peers only have their liveness mark refreshed; the
    /// node's own address is ignored.
    pub fn peer_joined(&self, peer: HostPort) {
        if self.is_self(&peer) {
            return;
        }
        let Some(port) = endpoint::offset_port(peer.port, endpoint::INBOUND_PORT_OFFSET) else {
            warn!(%peer, "peer port leaves no room for the inbound offset");
            return;
        };

        let mut state = self.state.lock();
        if !state.peers.mark_alive(peer.clone()) {
            return;
        }
        let target = endpoint::tcp(&peer.host, port);
        match state.outbound.connect(&target) {
            Ok(()) => info!(%peer, "pubsub connected to new peer"),
            Err(err) => warn!(%peer, error = %err, "error connecting to peer"),
        }
    }

    /// End of a topology scan: disconnect every peer the scan did not mark,
    /// and reset the marks of the rest.
    pub fn peer_scan_complete(&self) {
        let mut state = self.state.lock();
        for peer in state.peers.sweep() {
            let Some(port) = endpoint::offset_port(peer.port, endpoint::INBOUND_PORT_OFFSET) else {
                continue;
            };
            let target = endpoint::tcp(&peer.host, port);
            match state.outbound.disconnect(&target) {
                Ok(()) => info!(%peer, "pubsub disconnected from departed peer"),
                Err(err) => warn!(%peer, error = %err, "error disconnecting from peer"),
            }
        }
    }

    fn is_self(&self, peer: &HostPort) -> bool {
        peer.port == self.own_port && matches!(peer.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Context, SocketKind};

    #[test]
    fn test_peer_set_mark_and_sweep() {
        let mut peers = PeerSet::default();
        assert!(peers.mark_alive(HostPort::new("a", 1)));
        assert!(peers.mark_alive(HostPort::new("b", 2)));
        assert!(!peers.mark_alive(HostPort::new("a", 1)));

        // First sweep: both were marked during this scan, both stay.
        assert!(peers.sweep().is_empty());
        assert_eq!(peers.len(), 2);

        // Only "a" shows up in the next scan; "b" is pruned.
        peers.mark_alive(HostPort::new("a", 1));
        assert_eq!(peers.sweep(), vec![HostPort::new("b", 2)]);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_publish_round_trip_over_inproc() {
        let ctx = Context::new();
        let outbound = ctx.socket(SocketKind::Pub).unwrap();
        outbound.bind("inproc://publish-test").unwrap();

        let subscriber = ctx.socket(SocketKind::Sub).unwrap();
        subscriber.connect("inproc://publish-test").unwrap();
        subscriber.set_subscribe(b"").unwrap();

        let publisher = Publisher::new(outbound, None, vec!["$events".to_string()], 0);
        assert!(publisher.publish(b"room.a", br#"{"x":1}"#));

        let channel = subscriber.recv().unwrap();
        let payload = subscriber.recv().unwrap();
        let stamp = subscriber.recv().unwrap();
        let frames = MessageFrames::decode(&channel, &payload, &stamp).unwrap();
        assert_eq!(frames.channel(), b"room.a");
        assert_eq!(frames.payload(), br#"{"x":1}"#);
        assert!(frames.sent_at_micros() > 0);
    }

    #[test]
    fn test_events_channel_is_forwarded_to_config_push() {
        let ctx = Context::new();
        let outbound = ctx.socket(SocketKind::Pub).unwrap();
        outbound.bind("inproc://publish-events-out").unwrap();

        let pull = ctx.socket(SocketKind::Pull).unwrap();
        pull.bind("inproc://publish-events-cfg").unwrap();
        let push = ctx.socket(SocketKind::Push).unwrap();
        push.connect("inproc://publish-events-cfg").unwrap();

        let publisher = Publisher::new(outbound, Some(push), vec!["$events".to_string()], 0);
        assert!(publisher.publish(b"$events.inserts", br#"{"n":1}"#));
        assert!(publisher.publish(b"ordinary", br#"{"n":2}"#));

        // Only the reserved-prefix publication reaches the config queue.
        let channel = pull.recv().unwrap();
        assert_eq!(channel, b"$events.inserts\0");
        pull.recv().unwrap();
        pull.recv().unwrap();
        assert_eq!(pull.recv_nowait().unwrap(), None);
    }
}
