//! Temporary Index Lifecycle Tests
//!
//! Tests for ephemeral index invariants:
//! - Deleted exactly once, after the last owner is disposed
//! - Double deletion fails with a lifecycle error
//! - Deletion while a query is in flight fails with a lifecycle error
//! - Unavailable for scans once deleted

mod support;

use std::sync::Arc;
use std::thread;

use aeroview::index::{
    map_function, IndexEngine, IndexError, IndexRequest, IndexStalenessPolicy, IndexTarget,
    KeyRange, KeySelection, AllDocsMode, MapFunction,
};
use aeroview::query::{LifecycleViolation, QuerySpec};
use aeroview::QueryError;
use serde_json::{json, Value};

use support::{database_with_docs, gated_database, put_numbered};

fn by_id() -> MapFunction {
    map_function(|doc, emit| emit.emit(doc.id.as_str(), Value::Null))
}

fn scan_request(target: IndexTarget) -> IndexRequest {
    IndexRequest {
        target,
        selection: KeySelection::Range(KeyRange::unbounded()),
        skip: 0,
        limit: None,
        descending: false,
        reduce: false,
        reduce_specified: true,
        group_level: 0,
        include_docs: false,
        update_seq: true,
        stale: IndexStalenessPolicy::RefreshBefore,
        all_docs_mode: AllDocsMode::All,
    }
}

// =============================================================================
// Exactly-once Deletion
// =============================================================================

/// Build from a map function, run once, dispose: deleted once, then unavailable.
#[test]
fn test_run_then_dispose_deletes_once() {
    let (db, engine) = database_with_docs(4);
    let mut spec = db.slow_query(by_id()).unwrap();
    let index = Arc::clone(spec.index().unwrap());
    assert!(index.is_ephemeral());

    assert_eq!(spec.run_sync().unwrap().len(), 4);
    spec.dispose().unwrap();

    assert!(!engine.index_exists(index.id()));
    assert_eq!(db.metrics().temp_indexes_created, 1);
    assert_eq!(db.metrics().temp_indexes_deleted, 1);
    assert!(matches!(
        engine.scan(&scan_request(IndexTarget::Index(index.id()))),
        Err(IndexError::Unavailable(_))
    ));
    assert!(matches!(spec.run_sync(), Err(QueryError::IndexUnavailable(_))));
}

/// Second dispose is a fatal lifecycle error; nothing is deleted twice.
#[test]
fn test_double_dispose_fails() {
    let (db, _engine) = database_with_docs(1);
    let mut spec = db.slow_query(by_id()).unwrap();
    let id = spec.index().unwrap().id();

    spec.dispose().unwrap();
    let err = spec.dispose().unwrap_err();
    assert_eq!(err, QueryError::Lifecycle(LifecycleViolation::AlreadyDeleted(id)));
    assert!(err.is_fatal());
    assert_eq!(db.metrics().temp_indexes_deleted, 1);
}

/// Direct second deletion through the lifetime record also fails.
#[test]
fn test_double_delete_fails() {
    let (db, _engine) = database_with_docs(1);
    let spec = db.slow_query(by_id()).unwrap();
    let temporary = Arc::clone(spec.temporary_index().unwrap());

    temporary.delete().unwrap();
    assert!(matches!(
        temporary.delete(),
        Err(QueryError::Lifecycle(LifecycleViolation::AlreadyDeleted(_)))
    ));
}

/// Copies keep the index alive until every owner is gone.
#[test]
fn test_copies_delay_deletion() {
    let (db, engine) = database_with_docs(2);
    let mut spec = db.slow_query(by_id()).unwrap();
    let copy = QuerySpec::copy_from(&spec).unwrap();
    let id = spec.index().unwrap().id();

    spec.dispose().unwrap();
    assert!(engine.index_exists(id));
    assert_eq!(copy.run_sync().unwrap().len(), 2);

    drop(copy);
    assert!(!engine.index_exists(id));
    assert_eq!(db.metrics().temp_indexes_deleted, 1);
}

// =============================================================================
// In-flight Protection
// =============================================================================

/// Deleting while run_sync is scanning fails with InUse.
#[test]
fn test_delete_during_run_sync() {
    let (db, gated) = gated_database(2, 0);
    put_numbered(&gated.inner, 0..3);
    let spec = db.slow_query(by_id()).unwrap();
    let temporary = Arc::clone(spec.temporary_index().unwrap());

    thread::scope(|scope| {
        let running = scope.spawn(|| spec.run_sync());
        gated.wait_entered_blocking(1);

        assert_eq!(
            temporary.delete().unwrap_err(),
            QueryError::Lifecycle(LifecycleViolation::InUse(temporary.handle().id()))
        );

        gated.open();
        assert_eq!(running.join().unwrap().unwrap().len(), 3);
    });

    temporary.delete().unwrap();
    assert!(!gated.inner.index_exists(temporary.handle().id()));
}

/// Disposing the last owner while run_async is in flight fails; afterwards it succeeds.
#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_during_run_async() {
    let (db, gated) = gated_database(2, 0);
    put_numbered(&gated.inner, 0..3);
    let mut spec = db.slow_query(by_id()).unwrap();
    let id = spec.index().unwrap().id();

    let pending = db.dispatcher().submit(&spec);
    gated.wait_entered(1).await;

    assert_eq!(
        spec.dispose().unwrap_err(),
        QueryError::Lifecycle(LifecycleViolation::InUse(id))
    );
    assert!(gated.inner.index_exists(id));

    gated.open();
    assert_eq!(pending.wait().await.unwrap().len(), 3);

    spec.dispose().unwrap();
    assert!(!gated.inner.index_exists(id));
}

/// A queued async run holds the index even before it starts scanning.
#[tokio::test(flavor = "multi_thread")]
async fn test_queued_run_counts_as_in_flight() {
    let (db, gated) = gated_database(1, 0);
    let busy = db.create_all_documents_query();
    let blocker = db.dispatcher().submit(&busy);
    gated.wait_entered(1).await;

    let mut spec = db.slow_query(by_id()).unwrap();
    let queued = db.dispatcher().submit(&spec);
    assert!(matches!(spec.dispose(), Err(QueryError::Lifecycle(LifecycleViolation::InUse(_)))));

    gated.open();
    blocker.wait().await.unwrap();
    queued.wait().await.unwrap();
    spec.dispose().unwrap();
}

// =============================================================================
// Drop Without Dispose
// =============================================================================

/// Dropping mid-scan defers deletion to the end of the scan.
#[tokio::test(flavor = "multi_thread")]
async fn test_drop_defers_until_scan_ends() {
    let (db, gated) = gated_database(2, 0);
    put_numbered(&gated.inner, 0..2);
    let spec = db.slow_query(by_id()).unwrap();
    let temporary = Arc::clone(spec.temporary_index().unwrap());

    let pending = db.dispatcher().submit(&spec);
    gated.wait_entered(1).await;
    drop(spec);
    assert!(!temporary.is_deleted());

    gated.open();
    assert_eq!(pending.wait().await.unwrap().len(), 2);
    assert!(temporary.is_deleted());
    assert_eq!(db.metrics().temp_indexes_deleted, 1);
}

/// Ephemeral indexes emit what the map function emits.
#[test]
fn test_slow_query_rows_follow_map() {
    let (db, engine) = database_with_docs(0);
    engine.put_document("x", json!({"tag": "red"})).unwrap();
    engine.put_document("y", json!({"tag": "blue"})).unwrap();

    let mut spec = db
        .slow_query(map_function(|doc, emit| {
            if let Some(tag) = doc.body.get("tag").and_then(Value::as_str) {
                emit.emit(tag, json!(doc.id));
            }
        }))
        .unwrap();
    let rows = spec.run_sync().unwrap();
    let keys: Vec<_> = rows.iter().map(|r| r.key.to_json()).collect();
    assert_eq!(keys, vec![json!("blue"), json!("red")]);
    spec.dispose().unwrap();
}
