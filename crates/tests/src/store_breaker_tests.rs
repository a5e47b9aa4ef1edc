//! The store client's breaker: sustained failures trip it, tripped calls
//! fail fast with the distinguishable CircuitOpen error, and recovery
//! follows the half-open probe.

use crate::fixtures::SharedStore;
use connect_services::BreakerState;
use connect_services::store::StoreError;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn sustained_failures_trip_the_breaker() {
    let store = SharedStore::new();
    let client = store.client();
    store.backend.set_failing(true);

    for _ in 0..5 {
        assert!(matches!(
            client.ping().await,
            Err(StoreError::Backend(_))
        ));
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);

    // Fail fast now, without touching the backend.
    store.backend.set_failing(false);
    assert!(matches!(client.ping().await, Err(StoreError::CircuitOpen)));
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_through_half_open() {
    let store = SharedStore::new();
    let client = store.client();
    store.backend.set_failing(true);
    for _ in 0..5 {
        let _ = client.ping().await;
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);
    store.backend.set_failing(false);

    tokio::time::advance(Duration::from_secs(31)).await;

    // Two successful probes close it again.
    client.ping().await.unwrap();
    assert_eq!(client.breaker().state(), BreakerState::HalfOpen);
    client.ping().await.unwrap();
    assert_eq!(client.breaker().state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens() {
    let store = SharedStore::new();
    let client = store.client();
    store.backend.set_failing(true);
    for _ in 0..5 {
        let _ = client.ping().await;
    }

    tokio::time::advance(Duration::from_secs(31)).await;

    // Still failing at probe time: straight back to open.
    let _ = client.ping().await;
    assert_eq!(client.breaker().state(), BreakerState::Open);
    assert!(matches!(client.ping().await, Err(StoreError::CircuitOpen)));
}

#[tokio::test]
async fn normal_operations_pass_through() {
    let store = SharedStore::new();
    let client = store.client();

    client
        .set_with_ttl("k", "v", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(client.get("k").await.unwrap(), Some("v".to_string()));
    assert_eq!(client.breaker().state(), BreakerState::Closed);
}
