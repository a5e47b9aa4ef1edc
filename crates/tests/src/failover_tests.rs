//! Two-node failover: a room assigned to a server whose heartbeat lapsed
//! is taken over by the next server that asks.

use crate::fixtures::{SharedStore, fresh_status, stale_status};
use connect_services::store::keys;

#[tokio::test]
async fn room_sticks_to_healthy_owner() {
    let store = SharedStore::new();
    let node_1 = store.routing("server-1");
    let node_2 = store.routing("server-2");

    node_1.heartbeat().await.unwrap();
    node_2.heartbeat().await.unwrap();

    let owner = node_1.get_or_assign("room-a").await;
    // Whoever won the hash, both nodes agree afterwards.
    assert_eq!(node_2.get_or_assign("room-a").await, owner);
    assert_eq!(node_1.get_or_assign("room-a").await, owner);
}

#[tokio::test]
async fn dead_server_is_taken_over() {
    let store = SharedStore::new();
    let client = store.client();

    // server-1 owned the room, then stopped heartbeating.
    client
        .set_json_with_ttl(
            &keys::server_status("server-1"),
            &stale_status("server-1"),
            keys::SERVER_STATUS_TTL,
        )
        .await
        .unwrap();
    client
        .set_with_ttl(&keys::room_route("room-a"), "server-1", keys::ROOM_ROUTE_TTL)
        .await
        .unwrap();
    client
        .set_add(&keys::server_rooms("server-1"), "room-a")
        .await
        .unwrap();

    let node_2 = store.routing("server-2");
    node_2.heartbeat().await.unwrap();

    assert!(node_2.should_handle("room-a").await);

    // The mapping now points at server-2 and the old reverse index entry
    // is gone.
    assert_eq!(
        client.get(&keys::room_route("room-a")).await.unwrap(),
        Some("server-2".to_string())
    );
    assert!(
        client
            .set_members(&keys::server_rooms("server-1"))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        client
            .set_members(&keys::server_rooms("server-2"))
            .await
            .unwrap(),
        vec!["room-a".to_string()]
    );
}

#[tokio::test]
async fn healthy_peer_keeps_its_room() {
    let store = SharedStore::new();
    let client = store.client();

    client
        .set_json_with_ttl(
            &keys::server_status("server-1"),
            &fresh_status("server-1"),
            keys::SERVER_STATUS_TTL,
        )
        .await
        .unwrap();
    client
        .set_with_ttl(&keys::room_route("room-a"), "server-1", keys::ROOM_ROUTE_TTL)
        .await
        .unwrap();

    let node_2 = store.routing("server-2");
    assert!(!node_2.should_handle("room-a").await);
    assert_eq!(
        client.get(&keys::room_route("room-a")).await.unwrap(),
        Some("server-1".to_string())
    );
}

#[tokio::test]
async fn at_most_one_assignment_per_room() {
    let store = SharedStore::new();
    let node_1 = store.routing("server-1");
    let node_2 = store.routing("server-2");
    node_1.heartbeat().await.unwrap();
    node_2.heartbeat().await.unwrap();

    // Both nodes race the same room; the store holds exactly one mapping.
    let (a, b) = tokio::join!(node_1.get_or_assign("room-x"), node_2.get_or_assign("room-x"));
    let stored = store
        .client()
        .get(&keys::room_route("room-x"))
        .await
        .unwrap()
        .expect("a mapping exists");
    assert!(stored == a || stored == b);
}
