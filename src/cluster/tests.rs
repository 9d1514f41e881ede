//! End-to-end behavior of the cluster client against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::core::command;
use crate::core::Error;
use crate::proto::frame::Frame;
use crate::testing::MockCluster;

/// node1 owns [0, 6000), node2 owns [6000, 16384).
fn split_cluster() -> MockCluster {
    let cluster = MockCluster::new();
    cluster.add_node("node1", 7000);
    cluster.add_node("node2", 7001);
    cluster.meet("node1", "node2");
    cluster.add_slots("node1", 0..6000);
    cluster.add_slots("node2", 6000..16384);
    cluster
}

fn builder(cluster: &MockCluster) -> ClusterClientBuilder {
    ClusterClient::builder()
        .seeds("127.0.0.1:7000")
        .connector(cluster.connector())
}

/// Lets spawned eviction tasks run.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_merged_clusters_show_up_after_interval() {
    let cluster = MockCluster::new();
    cluster.add_node("a", 7000);
    cluster.add_node("b", 7001);
    cluster.add_slots("a", 0..8192);
    cluster.add_slots("b", 8192..16384);

    let client = builder(&cluster)
        .periodic_refresh(true)
        .refresh_interval(Duration::from_secs(1))
        .build()
        .await
        .unwrap();
    assert_eq!(client.partitions().len(), 1);

    cluster.meet("a", "b");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let partitions = client.partitions();
    assert_eq!(partitions.len(), 2);
    assert!(partitions.is_fully_covered());
    client.shutdown();
}

#[tokio::test]
async fn test_keys_route_to_slot_owner() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();

    assert_eq!(key_slot("A"), 6373);
    assert_eq!(key_slot("t"), 15891);
    assert_eq!(key_slot("p"), 16023);

    for key in ["A", "t", "p"] {
        let routed = client.route(command::set(key, "v")).await.unwrap();
        assert_eq!(routed.reply, Frame::simple("OK"));
        assert_eq!(routed.executions, 1);
        assert_eq!(routed.address, "127.0.0.1:7001", "key {}", key);
    }
    assert_eq!(cluster.log("node2"), vec!["SET A v", "SET t v", "SET p v"]);

    // Slot 5061 belongs to node1.
    let routed = client.route(command::get("bar")).await.unwrap();
    assert_eq!(routed.address, "127.0.0.1:7000");
}

#[tokio::test]
async fn test_moved_slot_costs_one_redirect() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();
    client.set("A", "1").await.unwrap();

    cluster.set_migrating(6373, "node2", "node1");
    cluster.move_slot(6373, "node2", "node1");

    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.reply, Frame::bulk("1"));
    assert_eq!(routed.executions, 2);
    assert_eq!(routed.address, "127.0.0.1:7000");
}

#[tokio::test]
async fn test_ask_does_not_touch_partitions() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();
    cluster.set_migrating(6373, "node2", "node1");

    // Not present on node2 any more, so node2 answers ASK.
    let routed = client.route(command::get("{A}.migrated")).await.unwrap();
    assert!(routed.reply.is_null());
    assert_eq!(routed.executions, 2);
    assert_eq!(routed.address, "127.0.0.1:7000");
    assert!(cluster.log("node1").ends_with(&["ASKING".to_string(), "GET {A}.migrated".to_string()]));

    let owner = client.partitions().lookup(6373).cloned().unwrap();
    assert_eq!(owner.id.as_str(), "node2");

    // A key still on node2 is served there.
    cluster.insert("node2", "A", "kept");
    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.reply, Frame::bulk("kept"));
    assert_eq!(routed.executions, 1);
}

#[tokio::test]
async fn test_forgotten_node_loses_its_connection() {
    let cluster = split_cluster();
    cluster.add_node("node3", 7002);
    cluster.meet("node1", "node3");
    cluster.del_slots("node2", 12000..16384);
    cluster.add_slots("node3", 12000..16384);

    let client = builder(&cluster).build().await.unwrap();
    assert_eq!(client.node_count(), 3);
    for key in ["bar", "A", "t"] {
        client.set(key, "v").await.unwrap();
    }
    assert_eq!(client.connection_count(), 3);

    cluster.del_slots("node3", 12000..16384);
    cluster.add_slots("node2", 12000..16384);
    cluster.forget("node3");

    assert!(client.reload_partitions().await.unwrap());
    settle().await;

    assert_eq!(client.connection_count(), 2);
    let partitions = client.partitions();
    assert_eq!(partitions.len(), 2);
    assert!(partitions.node_by_id(&NodeId::new("node3")).is_none());
    assert_eq!(cluster.open_connections(), 2);
}

#[tokio::test]
async fn test_reload_without_change_is_idempotent() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();
    client.set("A", "1").await.unwrap();
    client.set("bar", "1").await.unwrap();
    let before = client.partitions();

    assert!(!client.reload_partitions().await.unwrap());
    assert!(!client.reload_partitions().await.unwrap());
    settle().await;

    assert!(Arc::ptr_eq(&before, &client.partitions()));
    assert_eq!(client.connection_count(), 2);
    assert_eq!(cluster.open_connections(), 2);
}

#[tokio::test]
async fn test_reload_failure_keeps_partitions() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();
    let before = client.partitions();

    cluster.set_unreachable("node1", true);
    cluster.set_unreachable("node2", true);
    match client.reload_partitions().await {
        Err(Error::RefreshFailure { seeds }) => assert_eq!(seeds.len(), 2),
        other => panic!("expected RefreshFailure, got {:?}", other),
    }
    assert!(Arc::ptr_eq(&before, &client.partitions()));
}

#[tokio::test]
async fn test_unowned_slot_is_still_sent() {
    let cluster = split_cluster();
    cluster.del_slots("node2", [6373]);
    let client = builder(&cluster).build().await.unwrap();
    assert!(client.partitions().lookup(6373).is_none());

    // Nobody serves the slot: the node that was asked says so.
    let result = client.get("A").await;
    assert!(matches!(result, Err(Error::ClusterDown { .. })));
    assert_eq!(cluster.log("node1").last().map(String::as_str), Some("GET A"));

    // The slot got an owner the client has not seen yet.
    cluster.add_slots("node2", [6373]);
    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.executions, 2);
    assert_eq!(routed.address, "127.0.0.1:7001");
}

#[tokio::test]
async fn test_cross_slot_is_rejected() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();

    let result = client.route(command::mget(["A", "bar"])).await;
    assert!(matches!(result, Err(Error::CrossSlot)));

    // Same hash tag, same slot: sent to node2, which does not know MGET.
    let result = client
        .route(command::mget(["{user1000}.following", "{user1000}.followers"]))
        .await;
    assert!(matches!(result, Err(Error::Server { .. })));
    assert_eq!(
        cluster.log("node2"),
        vec!["MGET {user1000}.following {user1000}.followers"]
    );
}

#[tokio::test]
async fn test_redirect_chain_is_bounded() {
    let cluster = split_cluster();
    let bounded = builder(&cluster).max_executions(2).build().await.unwrap();

    // The client still believes node2 owns slot 6373; node1 took it over and
    // is already handing it back to node2.
    cluster.move_slot(6373, "node2", "node1");
    cluster.set_migrating(6373, "node1", "node2");

    match bounded.route(command::get("A")).await {
        Err(Error::RedirectExhausted { executions, address }) => {
            assert_eq!(executions, 2);
            assert_eq!(address, "127.0.0.1:7001");
        }
        other => panic!("expected RedirectExhausted, got {:?}", other),
    }

    let client = builder(&cluster).build().await.unwrap();
    // Bootstrapped after the move, so the table already points at node1.
    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.executions, 2);
    assert_eq!(routed.address, "127.0.0.1:7001");
}

#[tokio::test(start_paused = true)]
async fn test_moved_triggers_early_refresh() {
    let cluster = split_cluster();
    let client = builder(&cluster)
        .periodic_refresh(true)
        .refresh_interval(Duration::from_secs(3600))
        .build()
        .await
        .unwrap();

    cluster.move_slot(6373, "node2", "node1");
    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.executions, 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let owner = client.partitions().lookup(6373).cloned().unwrap();
    assert_eq!(owner.id.as_str(), "node1");

    let routed = client.route(command::get("A")).await.unwrap();
    assert_eq!(routed.executions, 1);
    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_moved_does_not_refresh_when_disabled() {
    let cluster = split_cluster();
    let client = builder(&cluster)
        .periodic_refresh(true)
        .refresh_on_moved(false)
        .refresh_interval(Duration::from_secs(3600))
        .build()
        .await
        .unwrap();

    cluster.move_slot(6373, "node2", "node1");
    client.route(command::get("A")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let owner = client.partitions().lookup(6373).cloned().unwrap();
    assert_eq!(owner.id.as_str(), "node2");
    client.shutdown();
}

#[tokio::test]
async fn test_commands_race_table_swaps() {
    let cluster = split_cluster();
    let client = builder(&cluster).build().await.unwrap();
    client.set("A", "1").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.get("A").await }));
    }
    for round in 0..8 {
        if round % 2 == 0 {
            cluster.move_slot(6373, "node2", "node1");
        } else {
            cluster.move_slot(6373, "node1", "node2");
        }
        client.reload_partitions().await.unwrap();
        tokio::task::yield_now().await;
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Some(Bytes::from("1")));
    }
}
