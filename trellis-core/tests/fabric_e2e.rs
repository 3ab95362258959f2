//! End-to-end fabric tests on live sockets.
//!
//! Each test bootstraps its own fabric on a free base port, so suites can run
//! in parallel. Settle sleeps give TCP connects and subscription propagation
//! time to land before traffic flows; polls use generous timeouts so the
//! assertions do not race the transport.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use trellis_core::config::{FabricConfig, HostPort, NodeRole};
use trellis_core::fabric::Fabric;
use trellis_core::id::SubscriptionId;
use trellis_core::message::SubscriptionMessage;
use trellis_core::poll::PollOutcome;
use trellis_core::registry::SubscriptionError;

const SETTLE: Duration = Duration::from_millis(300);

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// A base port whose derived endpoints are also free.
fn free_base_port() -> u16 {
    loop {
        let port = portpicker::pick_unused_port().expect("no free ports");
        if port < 60_000 && portpicker::is_free(port + 1234) && portpicker::is_free(port + 2345) {
            return port;
        }
    }
}

fn shard_fabric() -> Fabric {
    init_tracing();
    let fabric = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, free_base_port()));
    assert!(fabric.is_enabled());
    // Let the self-loop PUB connection establish.
    thread::sleep(SETTLE);
    fabric
}

fn debug_shard_fabric() -> Fabric {
    init_tracing();
    let config =
        FabricConfig::new(NodeRole::Shard, free_base_port()).with_debug_timeouts(true);
    let fabric = Fabric::bootstrap(config);
    assert!(fabric.is_enabled());
    thread::sleep(SETTLE);
    fabric
}

fn ids(list: &[SubscriptionId]) -> BTreeSet<SubscriptionId> {
    list.iter().copied().collect()
}

fn sorted_messages(outcome: PollOutcome) -> Vec<SubscriptionMessage> {
    let mut ordered = outcome.messages.into_sorted_vec();
    ordered.reverse();
    ordered
}

#[test]
fn test_single_node_fanout_to_overlapping_subscriptions() {
    let fabric = shard_fabric();

    let s1 = fabric.subscribe("room.a", None, None).unwrap();
    let s2 = fabric.subscribe("room.", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(fabric.publish("room.a", &json!({"x": 1})));

    let outcome = fabric.poll(&ids(&[s1, s2]), 2000);
    assert!(outcome.errors.is_empty());
    assert!(!outcome.poll_again);
    assert!(outcome.millis_polled < 2000);

    let messages = sorted_messages(outcome);
    assert_eq!(messages.len(), 2);
    for message in &messages {
        assert_eq!(message.channel, "room.a");
        assert_eq!(message.message, json!({"x": 1}));
    }
    let delivered: BTreeSet<SubscriptionId> =
        messages.iter().map(|m| m.subscription_id).collect();
    assert_eq!(delivered, ids(&[s1, s2]));
}

#[test]
fn test_channel_prefix_matching() {
    let fabric = shard_fabric();

    let id = fabric.subscribe("abc", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(fabric.publish("abcd", &json!({"y": 2})));

    let messages = sorted_messages(fabric.poll(&ids(&[id]), 2000));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].channel, "abcd");
    assert_eq!(messages[0].message, json!({"y": 2}));
}

#[test]
fn test_poll_times_out_without_messages() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("quiet", None, None).unwrap();

    let outcome = fabric.poll(&ids(&[id]), 300);
    assert!(outcome.messages.is_empty());
    assert!(outcome.errors.is_empty());
    assert!(!outcome.poll_again);
    assert!((250..=400).contains(&outcome.millis_polled));
}

#[test]
fn test_zero_timeout_returns_immediately() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("quiet", None, None).unwrap();

    let outcome = fabric.poll(&ids(&[id]), 0);
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.millis_polled, 0);
    assert!(!outcome.poll_again);
}

#[test]
fn test_system_cap_sets_poll_again() {
    let fabric = debug_shard_fabric();
    let id = fabric.subscribe("capped", None, None).unwrap();

    // Client asks for five seconds; the collapsed cap cuts the wait at 100ms.
    let outcome = fabric.poll(&ids(&[id]), 5000);
    assert!(outcome.messages.is_empty());
    assert_eq!(outcome.millis_polled, 100);
    assert!(outcome.poll_again);
}

#[test]
fn test_unsubscribe_cancels_active_poll() {
    let fabric = Arc::new(shard_fabric());
    let id = fabric.subscribe("cancel.me", None, None).unwrap();

    let poller = {
        let fabric = Arc::clone(&fabric);
        thread::spawn(move || fabric.poll(&ids(&[id]), 5000))
    };

    thread::sleep(Duration::from_millis(150));
    // The poll holds the lease, so destruction is deferred to its loop.
    assert!(fabric.unsubscribe(&ids(&[id])).is_empty());

    let outcome = poller.join().unwrap();
    assert_eq!(
        outcome.errors.get(&id),
        Some(&SubscriptionError::Interrupted)
    );
    assert!(outcome.messages.is_empty());
    assert!(outcome.millis_polled < 1000);

    // The cancellation destroyed the subscription.
    let errors = fabric.unsubscribe(&ids(&[id]));
    assert_eq!(errors.get(&id), Some(&SubscriptionError::NotFound));
}

#[test]
fn test_concurrent_polls_are_exclusive() {
    let fabric = Arc::new(shard_fabric());
    let id = fabric.subscribe("exclusive", None, None).unwrap();

    let poller = {
        let fabric = Arc::clone(&fabric);
        thread::spawn(move || fabric.poll(&ids(&[id]), 1000))
    };
    thread::sleep(Duration::from_millis(200));

    let outcome = fabric.poll(&ids(&[id]), 0);
    assert_eq!(
        outcome.errors.get(&id),
        Some(&SubscriptionError::PollActive)
    );

    let first = poller.join().unwrap();
    assert!(first.errors.is_empty());

    // The lease is free again once the first poll returns.
    assert!(fabric.poll(&ids(&[id]), 0).errors.is_empty());
}

#[test]
fn test_unsubscribe_twice_reports_not_found() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("once", None, None).unwrap();

    assert!(fabric.unsubscribe(&ids(&[id])).is_empty());
    let errors = fabric.unsubscribe(&ids(&[id]));
    assert_eq!(errors.get(&id), Some(&SubscriptionError::NotFound));
}

#[test]
fn test_drained_messages_are_not_redelivered() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("drain", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(fabric.publish("drain", &json!({"n": 1})));
    let first = sorted_messages(fabric.poll(&ids(&[id]), 2000));
    assert_eq!(first.len(), 1);

    let second = fabric.poll(&ids(&[id]), 0);
    assert!(second.messages.is_empty());
    assert!(second.errors.is_empty());
}

#[test]
fn test_newest_first_within_a_channel() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("feed", None, None).unwrap();
    thread::sleep(SETTLE);

    for n in 0..3 {
        assert!(fabric.publish("feed", &json!({"n": n})));
        // Distinct send timestamps keep the order deterministic.
        thread::sleep(Duration::from_millis(5));
    }

    // All three frames need to be queued before the drain runs.
    thread::sleep(SETTLE);
    let messages = sorted_messages(fabric.poll(&ids(&[id]), 2000));
    assert_eq!(messages.len(), 3);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].sent_at_micros >= pair[1].sent_at_micros));
    let order: Vec<&Value> = messages.iter().map(|m| &m.message["n"]).collect();
    assert_eq!(order, vec![&json!(2), &json!(1), &json!(0)]);
}

#[test]
fn test_filter_and_projection_shape_the_delivery() {
    let fabric = shard_fabric();
    let id = fabric
        .subscribe(
            "shaped.",
            Some(&json!({"kind": "alert"})),
            Some(&json!({"x": 1})),
        )
        .unwrap();
    thread::sleep(SETTLE);

    assert!(fabric.publish("shaped.a", &json!({"kind": "alert", "x": 1, "y": 2})));
    assert!(fabric.publish("shaped.a", &json!({"kind": "notice", "x": 3})));

    // Both frames need to be queued before the drain runs.
    thread::sleep(SETTLE);
    let messages = sorted_messages(fabric.poll(&ids(&[id]), 2000));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, json!({"x": 1}));
}

#[test]
fn test_idle_subscription_is_reaped() {
    let fabric = debug_shard_fabric();
    let id = fabric.subscribe("abandoned", None, None).unwrap();

    // Never polled: one full debug window plus slack passes.
    thread::sleep(Duration::from_millis(500));

    let errors = fabric.unsubscribe(&ids(&[id]));
    assert_eq!(errors.get(&id), Some(&SubscriptionError::NotFound));
}

#[test]
fn test_polling_keeps_a_subscription_alive() {
    let fabric = debug_shard_fabric();
    let id = fabric.subscribe("heartbeat", None, None).unwrap();

    // Each poll touches the liveness bit faster than the 100ms debug window
    // expires.
    for _ in 0..8 {
        let outcome = fabric.poll(&ids(&[id]), 0);
        assert!(outcome.errors.is_empty());
        thread::sleep(Duration::from_millis(60));
    }

    assert!(fabric.unsubscribe(&ids(&[id])).is_empty());
}

#[test]
fn test_poll_with_unknown_id_reports_per_id_error() {
    let fabric = shard_fabric();
    let known = fabric.subscribe("mixed", None, None).unwrap();
    let unknown = SubscriptionId::mint();
    thread::sleep(SETTLE);

    assert!(fabric.publish("mixed", &json!({"ok": true})));

    let outcome = fabric.poll(&ids(&[known, unknown]), 2000);
    assert_eq!(
        outcome.errors.get(&unknown),
        Some(&SubscriptionError::NotFound)
    );
    let messages = sorted_messages(outcome);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subscription_id, known);
}

#[test]
fn test_introspection_lists_live_subscriptions() {
    let fabric = shard_fabric();
    let id = fabric.subscribe("visible", None, None).unwrap();

    let listed = fabric.subscriptions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].channel, "visible");
    assert!(!listed[0].in_use);
    assert!(listed[0].polled_recently);

    fabric.unsubscribe(&ids(&[id]));
    assert!(fabric.subscriptions().is_empty());
}

#[test]
fn test_publications_fan_out_to_peer_shard_node() {
    init_tracing();
    let port_a = free_base_port();
    let node_a = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, port_a));
    let port_b = free_base_port();
    let node_b = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, port_b));
    assert!(node_a.is_enabled() && node_b.is_enabled());

    // The replication driver observed B from A.
    node_a.peer_joined(HostPort::new("127.0.0.1", port_b));
    thread::sleep(SETTLE);

    let on_b = node_b.subscribe("cluster.", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(node_a.publish("cluster.news", &json!({"from": "a"})));

    let messages = sorted_messages(node_b.poll(&ids(&[on_b]), 3000));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].channel, "cluster.news");
    assert_eq!(messages[0].message, json!({"from": "a"}));
}

#[test]
fn test_peer_scan_prunes_unobserved_peers() {
    init_tracing();
    let port_a = free_base_port();
    let node_a = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, port_a));
    let port_b = free_base_port();
    let node_b = Fabric::bootstrap(FabricConfig::new(NodeRole::Shard, port_b));

    node_a.peer_joined(HostPort::new("127.0.0.1", port_b));
    thread::sleep(SETTLE);

    // B stops being observed: the first scan end clears its mark, the second
    // disconnects it.
    node_a.peer_scan_complete();
    node_a.peer_scan_complete();
    thread::sleep(SETTLE);

    let on_b = node_b.subscribe("gone.", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(node_a.publish("gone.dark", &json!({})));
    let outcome = node_b.poll(&ids(&[on_b]), 500);
    assert!(outcome.messages.is_empty());
}

#[test]
fn test_routing_proxy_publishes_through_config_node() {
    init_tracing();
    let config_port = free_base_port();
    let config_node = Fabric::bootstrap(FabricConfig::new(NodeRole::Config, config_port));
    assert!(config_node.is_enabled());

    let proxy_port = free_base_port();
    let proxy = Fabric::bootstrap(
        FabricConfig::new(NodeRole::Proxy, proxy_port)
            .with_config_nodes(vec![HostPort::new("127.0.0.1", config_port)]),
    );
    assert!(proxy.is_enabled());
    thread::sleep(SETTLE);

    let id = proxy.subscribe("routed.", None, None).unwrap();
    thread::sleep(SETTLE);

    // PUSH up to the config node's queue, relayed to every attached proxy.
    assert!(proxy.publish("routed.back", &json!({"hop": 2})));

    let messages = sorted_messages(proxy.poll(&ids(&[id]), 3000));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].channel, "routed.back");
    assert_eq!(messages[0].message, json!({"hop": 2}));
}

#[test]
fn test_events_channel_reaches_proxies_from_shard_node() {
    init_tracing();
    let config_port = free_base_port();
    let config_node = Fabric::bootstrap(FabricConfig::new(NodeRole::Config, config_port));
    assert!(config_node.is_enabled());

    let shard_port = free_base_port();
    let shard = Fabric::bootstrap(
        FabricConfig::new(NodeRole::Shard, shard_port)
            .with_config_nodes(vec![HostPort::new("127.0.0.1", config_port)]),
    );
    let proxy_port = free_base_port();
    let proxy = Fabric::bootstrap(
        FabricConfig::new(NodeRole::Proxy, proxy_port)
            .with_config_nodes(vec![HostPort::new("127.0.0.1", config_port)]),
    );
    assert!(shard.is_enabled() && proxy.is_enabled());
    thread::sleep(SETTLE);

    let on_proxy = proxy.subscribe("$events", None, None).unwrap();
    let on_shard = shard.subscribe("$events", None, None).unwrap();
    thread::sleep(SETTLE);

    assert!(shard.publish("$events.inserts", &json!({"count": 4})));

    // The reserved prefix rides both the normal outbound socket (to local
    // subscribers) and the config route (to the proxies).
    let local = sorted_messages(shard.poll(&ids(&[on_shard]), 3000));
    assert_eq!(local.len(), 1);

    let relayed = sorted_messages(proxy.poll(&ids(&[on_proxy]), 3000));
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].message, json!({"count": 4}));
}
