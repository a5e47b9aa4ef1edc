//! Disconnect cleanup property: after the mirror sweep, the store holds
//! nothing for the socket — including index memberships whose resources
//! were never closed locally (crash window).

use crate::fixtures::SharedStore;
use connect_services::store::{keys, mirror};
use std::time::Duration;

async fn seed_socket(store: &SharedStore, socket_id: &str, room_id: &str) {
    let client = store.client();
    let ttl = Duration::from_secs(3600);

    for producer_id in ["p1", "p2", "p3"] {
        client
            .set_with_ttl(
                &keys::producer(producer_id),
                &format!(
                    r#"{{"producer_id":"{producer_id}","socket_id":"{socket_id}","room_id":"{room_id}","user_id":"u1","kind":"audio","source":"microphone","server_id":"server-1"}}"#
                ),
                ttl,
            )
            .await
            .unwrap();
        client
            .set_add(&keys::socket_producers(socket_id), producer_id)
            .await
            .unwrap();
        client
            .set_add(&keys::room_producers(room_id), producer_id)
            .await
            .unwrap();
    }

    for consumer_id in ["c1", "c2", "c3", "c4", "c5"] {
        client
            .set_with_ttl(&keys::consumer(consumer_id), "{}", ttl)
            .await
            .unwrap();
        client
            .set_add(&keys::socket_consumers(socket_id), consumer_id)
            .await
            .unwrap();
    }

    for transport_id in ["t1", "t2"] {
        client
            .set_with_ttl(&keys::transport(transport_id), "{}", ttl)
            .await
            .unwrap();
        client
            .set_add(&keys::socket_transports(socket_id), transport_id)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn clean_socket_leaves_no_trace() {
    let store = SharedStore::new();
    let client = store.client();
    seed_socket(&store, "sock-1", "room-1").await;

    assert!(mirror::socket_dirty(&client, "sock-1").await.unwrap());
    mirror::clean_socket(&client, "sock-1").await.unwrap();
    assert!(!mirror::socket_dirty(&client, "sock-1").await.unwrap());

    // Every per-resource key is gone.
    for key in [
        keys::producer("p1"),
        keys::producer("p2"),
        keys::producer("p3"),
        keys::consumer("c1"),
        keys::transport("t1"),
    ] {
        assert!(!client.exists(&key).await.unwrap(), "leftover: {key}");
    }

    // And the room index no longer references the socket's producers.
    assert!(
        client
            .set_members(&keys::room_producers("room-1"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn clean_socket_is_idempotent() {
    let store = SharedStore::new();
    let client = store.client();
    seed_socket(&store, "sock-1", "room-1").await;

    mirror::clean_socket(&client, "sock-1").await.unwrap();
    mirror::clean_socket(&client, "sock-1").await.unwrap();
    assert!(!mirror::socket_dirty(&client, "sock-1").await.unwrap());
}

#[tokio::test]
async fn other_sockets_survive_the_sweep() {
    let store = SharedStore::new();
    let client = store.client();
    seed_socket(&store, "sock-1", "room-1").await;

    client
        .set_with_ttl(&keys::producer("px"), "{}", Duration::from_secs(3600))
        .await
        .unwrap();
    client
        .set_add(&keys::socket_producers("sock-2"), "px")
        .await
        .unwrap();

    mirror::clean_socket(&client, "sock-1").await.unwrap();

    assert!(mirror::socket_dirty(&client, "sock-2").await.unwrap());
    assert!(client.exists(&keys::producer("px")).await.unwrap());
}
