//! Integration tests for the in-memory saga store.

use std::collections::BTreeMap;

use chrono::Utc;
use saga_store::{DataMap, InMemoryStore, Instance, SagaId, Status, Store, StoreError};
use serde_json::json;

fn new_instance(id: &str) -> Instance {
    Instance::new(
        SagaId::from(id),
        "fulfillment",
        ["reserve", "charge", "ship"],
        DataMap::new(),
        BTreeMap::new(),
        Utc::now(),
    )
}

#[tokio::test]
async fn test_create_then_load() {
    let store = InMemoryStore::new();
    let inst = new_instance("s-1");
    store.create(&inst).await.unwrap();

    let loaded = store.load(&inst.id).await.unwrap();
    assert_eq!(loaded, inst);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_create_rejects_duplicate_id() {
    let store = InMemoryStore::new();
    let inst = new_instance("s-1");
    store.create(&inst).await.unwrap();

    let err = store.create(&inst).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(id) if id.as_str() == "s-1"));
}

#[tokio::test]
async fn test_load_missing_is_not_found() {
    let store = InMemoryStore::new();
    let err = store.load(&SagaId::from("nope")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_save_increments_revision() {
    let store = InMemoryStore::new();
    let mut inst = new_instance("s-1");
    store.create(&inst).await.unwrap();

    inst.status = Status::Running;
    store.save(&mut inst).await.unwrap();
    assert_eq!(inst.revision, 1);
    store.save(&mut inst).await.unwrap();
    assert_eq!(inst.revision, 2);

    let loaded = store.load(&inst.id).await.unwrap();
    assert_eq!(loaded.revision, 2);
    assert_eq!(loaded.status, Status::Running);
}

#[tokio::test]
async fn test_stale_revision_conflicts() {
    let store = InMemoryStore::new();
    let inst = new_instance("s-1");
    store.create(&inst).await.unwrap();

    let mut first = store.load(&inst.id).await.unwrap();
    let mut second = store.load(&inst.id).await.unwrap();

    first.current = 1;
    store.save(&mut first).await.unwrap();

    second.current = 2;
    let err = store.save(&mut second).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Conflict { expected: 0, actual: 1, .. }
    ));
    assert_eq!(second.revision, 0, "failed save leaves revision untouched");
    assert_eq!(store.load(&inst.id).await.unwrap().current, 1);
}

#[tokio::test]
async fn test_reads_and_writes_do_not_alias() {
    let store = InMemoryStore::new();
    let mut inst = new_instance("s-1");
    store.create(&inst).await.unwrap();

    inst.steps[0].data.insert("k".into(), json!("local only"));
    let loaded = store.load(&inst.id).await.unwrap();
    assert!(loaded.steps[0].data.is_empty());

    store.save(&mut inst).await.unwrap();
    inst.steps[0].data.insert("k".into(), json!("changed after save"));
    let loaded = store.load(&inst.id).await.unwrap();
    assert_eq!(loaded.steps[0].data["k"], json!("local only"));
}

#[tokio::test]
async fn test_save_unknown_instance_is_not_found() {
    let store = InMemoryStore::new();
    let mut inst = new_instance("ghost");
    let err = store.save(&mut inst).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_failing_saves() {
    let store = InMemoryStore::new();
    let mut inst = new_instance("s-1");
    store.create(&inst).await.unwrap();
    store.set_fail_saves(true);
    assert!(matches!(
        store.save(&mut inst).await.unwrap_err(),
        StoreError::Backend(_)
    ));
}
