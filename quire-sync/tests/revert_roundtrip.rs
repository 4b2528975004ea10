//! Reverting documents through the in-process service.

use std::sync::Arc;

use serde_json::{json, Value};

use quire_sync::ot::json::path;
use quire_sync::ot::JsonOp;
use quire_sync::store::DocumentStore;
use quire_sync::{
    default_access, default_collections, default_migrations, DocData, DocKey, DocumentService, EngineConfig,
    LocalService, MemoryStore, MigrationRegistry, OpKind, Operation, RevertManifest, RevertTarget, Session,
    SnapshotReverter, SyncEngine, SyncError,
};

fn engine_with(store: Arc<MemoryStore>, registry: MigrationRegistry) -> Arc<SyncEngine> {
    SyncEngine::builder()
        .store(store)
        .collections(default_collections())
        .access(default_access())
        .migrations(registry)
        .config(EngineConfig::for_testing())
        .build()
        .unwrap()
}

async fn reverter(engine: &Arc<SyncEngine>) -> SnapshotReverter<LocalService> {
    let service = LocalService::connect(engine.clone(), Session::server()).await;
    SnapshotReverter::new(service, engine.registry().clone())
}

fn set(key: &str, value: Value) -> OpKind {
    OpKind::edit(Operation::Json(JsonOp::new().set(path(&[key]), value)))
}

fn create(value: Value) -> OpKind {
    OpKind::Create {
        data: DocData::Json(value),
    }
}

fn project(name: &str) -> Value {
    json!({"name": name, "editable": true, "translateConfig": {"shareEnabled": false}})
}

#[tokio::test]
async fn test_revert_restores_identical_data() {
    let engine = engine_with(Arc::new(MemoryStore::new()), default_migrations().unwrap());
    let reverter = reverter(&engine).await;
    let service = reverter.service();

    service.submit("projects", "p1", 0, create(project("A"))).await.unwrap();
    service.submit("projects", "p1", 1, set("name", json!("B"))).await.unwrap();
    service
        .submit("projects", "p1", 2, set("userRoles", json!({"u1": "pt_translator"})))
        .await
        .unwrap();
    let before = service.fetch_snapshot("projects", "p1", 1).await.unwrap();

    assert_eq!(reverter.revert("projects", "p1", 1).await.unwrap(), Some(4));
    let after = service.fetch("projects", "p1").await.unwrap();
    assert_eq!(after.version, 4);
    assert_eq!(after.data, before.data);

    // Already current: nothing is submitted.
    assert_eq!(reverter.revert("projects", "p1", 1).await.unwrap(), None);
    assert_eq!(service.fetch("projects", "p1").await.unwrap().version, 4);
}

#[tokio::test]
async fn test_revert_recreates_deleted_document() {
    let engine = engine_with(Arc::new(MemoryStore::new()), default_migrations().unwrap());
    let reverter = reverter(&engine).await;
    let service = reverter.service();

    service.submit("projects", "p2", 0, create(project("Gone"))).await.unwrap();
    service.submit("projects", "p2", 1, OpKind::Delete).await.unwrap();
    assert!(!service.fetch("projects", "p2").await.unwrap().exists());

    let plan = reverter.plan("projects", "p2", 1).await.unwrap();
    assert_eq!(plan.base_version, 2);
    assert!(matches!(plan.change, Some(OpKind::Create { .. })));

    assert_eq!(reverter.revert("projects", "p2", 1).await.unwrap(), Some(3));
    let restored = service.fetch("projects", "p2").await.unwrap();
    assert_eq!(restored.data, Some(DocData::Json(project("Gone"))));
}

#[tokio::test]
async fn test_revert_migrates_historical_data() {
    let store = Arc::new(MemoryStore::new());
    {
        let legacy = engine_with(store.clone(), MigrationRegistry::empty());
        let service = LocalService::connect(legacy, Session::server()).await;
        service
            .submit("projects", "p1", 0, create(json!({"name": "Old", "tagIcon": "flag"})))
            .await
            .unwrap();
    }

    let engine = engine_with(store.clone(), default_migrations().unwrap());
    let reverter = reverter(&engine).await;
    let service = reverter.service();
    // Loading migrates to v2; the rename lands at v3.
    let current = service.fetch("projects", "p1").await.unwrap();
    assert_eq!((current.version, current.schema_version), (2, 3));
    service.submit("projects", "p1", 2, set("name", json!("New"))).await.unwrap();

    assert_eq!(reverter.revert("projects", "p1", 1).await.unwrap(), Some(4));
    let reverted = service.fetch("projects", "p1").await.unwrap();
    assert_eq!(reverted.data, Some(DocData::Json(project("Old"))));
    assert_eq!(reverted.schema_version, 3);
}

#[tokio::test]
async fn test_compacted_version_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), default_migrations().unwrap());
    let reverter = reverter(&engine).await;
    let service = reverter.service();

    service.submit("projects", "p1", 0, create(project("A"))).await.unwrap();
    for (base, name) in [(1, "B"), (2, "C"), (3, "D")] {
        service.submit("projects", "p1", base, set("name", json!(name))).await.unwrap();
    }
    store
        .compact_history(&DocKey::new("projects", "p1"), 3)
        .await
        .unwrap();

    let err = reverter.revert("projects", "p1", 1).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)), "got {err:?}");
    assert_eq!(reverter.revert("projects", "p1", 3).await.unwrap(), Some(5));
}

#[tokio::test]
async fn test_manifest_continues_past_failures() {
    let engine = engine_with(Arc::new(MemoryStore::new()), default_migrations().unwrap());
    let reverter = reverter(&engine).await;
    let service = reverter.service();

    service.submit("projects", "p1", 0, create(project("A"))).await.unwrap();
    service.submit("projects", "p1", 1, set("name", json!("B"))).await.unwrap();
    service.submit("projects", "p2", 0, create(project("Same"))).await.unwrap();

    let manifest = RevertManifest(vec![
        RevertTarget {
            collection: "projects".into(),
            id: "p1".into(),
            version: 1,
        },
        RevertTarget {
            collection: "projects".into(),
            id: "missing".into(),
            version: 1,
        },
        RevertTarget {
            collection: "projects".into(),
            id: "p2".into(),
            version: 1,
        },
    ]);

    let dry = reverter.revert_manifest(&manifest, true).await;
    assert_eq!(dry.reverted.len(), 1);
    assert_eq!(dry.reverted[0].1, 2);
    assert_eq!(service.fetch("projects", "p1").await.unwrap().version, 2);

    let summary = reverter.revert_manifest(&manifest, false).await;
    assert!(!summary.is_success());
    assert_eq!(summary.reverted.len(), 1);
    assert_eq!(summary.reverted[0].1, 3);
    assert_eq!(summary.unchanged.len(), 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0.id, "missing");
    assert_eq!(summary.to_string(), "1 reverted, 1 already current, 1 failed");
}
