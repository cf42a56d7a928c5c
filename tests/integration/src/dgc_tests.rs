//! Distributed garbage collection: reclamation, version gating, re-export.

mod common;

use common::*;
use remi_core::{SessionConfig, Value};
use std::time::Duration;

#[tokio::test]
async fn test_unreferenced_export_is_reclaimed() {
    init_logging();
    let (client, server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let counter = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();
    let counter_id = counter.id();
    assert_eq!(
        counter.invoke(0, Vec::new()).await.unwrap().as_long().unwrap(),
        1
    );
    assert!(server.has_export(counter_id));

    // While referenced, rounds must not reclaim.
    client.run_dgc_round().await.unwrap();
    assert!(server.has_export(counter_id));

    // Drop the last reference; the next round reports the removal and the
    // server reclaims the export.
    drop(counter);
    client.run_dgc_round().await.unwrap();
    assert!(!server.has_export(counter_id));
}

#[tokio::test]
async fn test_reexport_after_reclaim_reuses_identifier() {
    init_logging();
    let (client, server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let counter = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();
    let original_id = counter.id();
    drop(counter);
    client.run_dgc_round().await.unwrap();
    assert!(!server.has_export(original_id));

    // The same server object re-exports under its old identifier with a
    // fresh version, and invocations work again.
    let counter = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();
    assert_eq!(counter.id(), original_id);
    assert!(server.has_export(original_id));
    assert_eq!(
        counter.invoke(0, Vec::new()).await.unwrap().as_long().unwrap(),
        1
    );
}

#[tokio::test]
async fn test_bound_objects_survive_reference_drops() {
    init_logging();
    let (client, server, _service) = service_pair().await;

    let stub = client.lookup("service").await.unwrap();
    let service_id = stub.id();
    drop(stub);
    client.run_dgc_round().await.unwrap();

    // Bindings are local retention; the export stays and a later lookup
    // still resolves.
    assert!(server.has_export(service_id));
    let stub = client.lookup("service").await.unwrap();
    let reply = stub
        .invoke(test_ord::ECHO, vec![Value::from("still bound")])
        .await
        .unwrap();
    assert_eq!(reply.into_str().unwrap(), "still bound");
}

#[tokio::test]
async fn test_periodic_rounds_reclaim_without_explicit_calls() {
    init_logging();
    let mut config = SessionConfig::default();
    config.dgc_period = Duration::from_millis(100);
    let (client, server) = session_pair_with(config.clone(), config).await;
    let service = TestService::new();
    server.bind(
        "service",
        std::sync::Arc::clone(&service) as std::sync::Arc<dyn remi_core::RemoteObject>,
        &test_service_factory(),
    );

    let stub = client.lookup("service").await.unwrap();
    let counter = stub
        .invoke(test_ord::CREATE, Vec::new())
        .await
        .unwrap()
        .into_remote()
        .unwrap()
        .into_stub()
        .unwrap();
    let counter_id = counter.id();
    drop(counter);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while server.has_export(counter_id) {
        assert!(
            std::time::Instant::now() < deadline,
            "periodic rounds never reclaimed the export"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
