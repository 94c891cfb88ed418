mod common;

use common::{test_config, wait_until, Cache, TestCluster};
use holo_replica::{ReplicaError, ServiceState};
use serde_json::json;

fn put_everywhere(cluster: &TestCluster, key: &str, value: serde_json::Value) {
    cluster.node(1).cache().put(key, value.clone()).expect("put");
    for id in cluster.members() {
        let store = &cluster.node(id).store;
        wait_until("replicated put", || store.local_get(key) == Some(value.clone()));
    }
}

#[test]
fn remove_is_true_only_when_every_member_removed() {
    let cluster = TestCluster::start(3);
    put_everywhere(&cluster, "k", json!(1));

    // Node 3 diverges: its copy is already gone.
    cluster.node(3).store.local_remove("k");
    assert!(!cluster.node(1).cache().remove("k").expect("remove"));

    put_everywhere(&cluster, "k", json!(2));
    assert!(cluster.node(1).cache().remove("k").expect("remove"));
    for id in cluster.members() {
        assert_eq!(cluster.node(id).store.local_get("k"), None);
    }
}

#[test]
fn keys_are_the_union_of_remote_members() {
    let cluster = TestCluster::start(3);
    put_everywhere(&cluster, "a", json!(1));
    put_everywhere(&cluster, "b", json!(2));
    cluster.node(3).store.local_insert("c", json!(3));
    cluster.node(1).store.local_insert("only-on-caller", json!(4));

    let keys = cluster.node(1).cache().keys().expect("keys");
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[test]
fn unreachable_member_fails_union_with_peer_detail() {
    let mut cluster = TestCluster::start(3);
    // Node 3 vanishes before any view change is delivered.
    cluster.remove_node(3);

    let err = cluster.node(1).cache().keys().expect_err("node 3 is gone");
    match err {
        ReplicaError::Dispatch { method, failures, .. } => {
            assert_eq!(method, "keys");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].peer, Some(3));
        }
        other => panic!("unexpected error: {other}"),
    }

    cluster.announce_view();
    assert!(cluster.node(1).cache().keys().expect("keys").is_empty());
}

#[test]
fn lone_member_executes_everything_locally() {
    let cluster = TestCluster::start(1);
    let cache = cluster.node(1).cache();
    cache.put("k", json!("v")).expect("put");
    assert_eq!(cache.get("k").expect("get"), Some(json!("v")));
    assert!(cache.keys().expect("remote-only").is_empty());
    assert!(cache.remove("k").expect("remove"));
    assert_eq!(cluster.node(1).service.transfer_metrics().started, 0);
}

#[test]
fn departures_are_reported_once() {
    let mut cluster = TestCluster::start(3);
    cluster.remove_node(3);
    cluster.announce_view();
    cluster.announce_view();

    for id in [1, 2] {
        assert_eq!(cluster.node(id).store.dropped(), vec![3]);
        assert_eq!(cluster.node(id).service.membership().peers().len(), 1);
    }
}

#[test]
fn joining_member_loads_initial_state() {
    let mut cluster = TestCluster::start(2);
    put_everywhere(&cluster, "a", json!({"qty": 1}));
    put_everywhere(&cluster, "b", json!([1, 2, 3]));

    cluster.add_node(3);
    let members = cluster.members();
    let joiner = cluster.node(3);
    joiner.service.start(&members).expect("join");
    assert_eq!(joiner.service.state(), ServiceState::Active);
    assert_eq!(joiner.store.local_address(), 3);
    assert_eq!(joiner.store.local_get("a"), Some(json!({"qty": 1})));
    assert_eq!(joiner.store.local_get("b"), Some(json!([1, 2, 3])));

    cluster.announce_view();
    put_everywhere(&cluster, "c", json!(true));
}

#[test]
fn join_without_reachable_peer_still_activates() {
    let mut cluster = TestCluster::empty(test_config());
    cluster.add_node(5);
    let node = cluster.node(5);
    node.service.start(&[5, 9]).expect("join");
    assert_eq!(node.service.state(), ServiceState::Active);
    assert_eq!(node.store.local_get("a"), None);
}
