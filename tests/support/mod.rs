//! Shared test fixtures
//!
//! - A gated engine whose scans block until the test opens the gate
//! - Database builders over the in-memory engine

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use aeroview::config::{AeroviewConfig, DispatchConfig, LiveQueryConfig};
use aeroview::index::{
    IndexDescriptor, IndexEngine, IndexHandle, IndexRequest, IndexResult, MapFunction,
    MemoryIndexEngine, ScanOutput,
};
use aeroview::Database;
use serde_json::json;

// =============================================================================
// Gated Engine
// =============================================================================

/// Wraps the in-memory engine; every scan waits for the gate to open
pub struct GatedEngine {
    pub inner: Arc<MemoryIndexEngine>,
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
}

impl GatedEngine {
    pub fn new(inner: Arc<MemoryIndexEngine>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            open: Mutex::new(false),
            opened: Condvar::new(),
            entered: AtomicUsize::new(0),
        })
    }

    /// Let every blocked and future scan through
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    /// Scans that reached the engine
    pub fn scans(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` scans reached the engine
    pub async fn wait_entered(&self, n: usize) {
        for _ in 0..500 {
            if self.scans() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} scans, saw {}", n, self.scans());
    }

    /// Blocking variant for plain threads
    pub fn wait_entered_blocking(&self, n: usize) {
        for _ in 0..500 {
            if self.scans() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("expected {} scans, saw {}", n, self.scans());
    }
}

impl IndexEngine for GatedEngine {
    fn scan(&self, request: &IndexRequest) -> IndexResult<ScanOutput> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.inner.scan(request)
    }

    fn create_ephemeral_index(&self, map: MapFunction) -> IndexResult<IndexHandle> {
        self.inner.create_ephemeral_index(map)
    }

    fn delete_index(&self, index: &IndexDescriptor) -> IndexResult<()> {
        self.inner.delete_index(index)
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn config(max_concurrent_scans: usize, update_interval_ms: u64) -> AeroviewConfig {
    AeroviewConfig {
        dispatch: DispatchConfig { max_concurrent_scans },
        live_query: LiveQueryConfig { update_interval_ms },
    }
}

/// Database whose scans go through a closed gate
pub fn gated_database(max_concurrent_scans: usize, update_interval_ms: u64) -> (Database, Arc<GatedEngine>) {
    let memory = MemoryIndexEngine::shared();
    let gated = GatedEngine::new(Arc::clone(&memory));
    let db = Database::new(gated.clone(), memory, config(max_concurrent_scans, update_interval_ms)).unwrap();
    (db, gated)
}

/// In-memory database holding `doc00..doc{n-1}` with `{"n": i}`
pub fn database_with_docs(n: i64) -> (Database, Arc<MemoryIndexEngine>) {
    let db = Database::in_memory(config(4, 0)).unwrap();
    let engine = Arc::clone(db.memory_engine().unwrap());
    put_numbered(&engine, 0..n);
    (db, engine)
}

pub fn put_numbered(engine: &MemoryIndexEngine, range: std::ops::Range<i64>) {
    for i in range {
        engine.put_document(&format!("doc{:02}", i), json!({ "n": i })).unwrap();
    }
}

/// Poll until `check` holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
