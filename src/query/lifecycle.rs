//! Ephemeral index lifetime
//!
//! A temporary index is created for one ad-hoc query family and shared by
//! every spec copied from it and every live query derived from it. Each of
//! those holds one owner share; scans hold a [`ScanGuard`].
//!
//! # Invariants
//!
//! - The index is deleted exactly once
//! - Deletion happens only after the last owner share is released
//! - Deletion never happens while a scan is in flight
//! - Explicit misuse (double delete, delete while in use) fails fast

use std::sync::{Arc, Mutex};

use crate::index::{IndexEngine, IndexHandle, MapFunction};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

use super::errors::{LifecycleViolation, QueryError, QueryResult};

#[derive(Debug, Default)]
struct LifecycleState {
    owners: usize,
    in_flight: usize,
    deleted: bool,
    /// Last owner dropped while a scan was running
    delete_when_idle: bool,
}

/// An ephemeral index plus its ownership and in-flight accounting
pub struct TemporaryIndex {
    engine: Arc<dyn IndexEngine>,
    handle: IndexHandle,
    state: Mutex<LifecycleState>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for TemporaryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryIndex")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> QueryError {
    QueryError::Internal("Lifecycle lock poisoned".into())
}

impl TemporaryIndex {
    /// Create the ephemeral index. The caller holds the first owner share.
    pub fn create(
        engine: Arc<dyn IndexEngine>,
        map: MapFunction,
        metrics: Arc<MetricsRegistry>,
    ) -> QueryResult<Arc<Self>> {
        let handle = engine.create_ephemeral_index(map)?;
        metrics.increment_temp_indexes_created();
        log_event_with_fields(Event::TempIndexCreated, &[("index", &handle.id().to_string())]);

        Ok(Arc::new(Self {
            engine,
            handle,
            state: Mutex::new(LifecycleState {
                owners: 1,
                ..LifecycleState::default()
            }),
            metrics,
        }))
    }

    pub fn handle(&self) -> &IndexHandle {
        &self.handle
    }

    /// Whether the index has been deleted from the engine
    pub fn is_deleted(&self) -> bool {
        self.state.lock().map(|s| s.deleted).unwrap_or(false)
    }

    /// Outstanding owner shares
    pub fn owners(&self) -> usize {
        self.state.lock().map(|s| s.owners).unwrap_or(0)
    }

    /// Scans currently running against the index
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight).unwrap_or(0)
    }

    /// Take another owner share (spec copy, live query)
    pub fn acquire_owner(&self) -> QueryResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.deleted || state.owners == 0 {
            return Err(self.violation(LifecycleViolation::AlreadyDeleted(self.handle.id())));
        }
        state.owners += 1;
        Ok(())
    }

    /// Release an owner share explicitly.
    ///
    /// Releasing the last share deletes the index. Fails with `InUse` if that
    /// deletion would race an in-flight scan, and with `AlreadyDeleted` when
    /// there is nothing left to release.
    pub fn release_owner(&self) -> QueryResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.deleted || state.owners == 0 {
            return Err(self.violation(LifecycleViolation::AlreadyDeleted(self.handle.id())));
        }
        if state.owners == 1 && state.in_flight > 0 {
            return Err(self.violation(LifecycleViolation::InUse(self.handle.id())));
        }

        state.owners -= 1;
        if state.owners == 0 {
            if let Err(err) = self.delete_locked(&mut state) {
                state.owners = 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release an owner share without failing; deletion waits for in-flight scans.
    pub fn release_deferred(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.owners == 0 {
            return;
        }
        state.owners -= 1;
        if state.owners > 0 || state.deleted {
            return;
        }

        log_event_with_fields(Event::TempIndexReleasedOnDrop, &[("index", &self.handle.id().to_string())]);
        if state.in_flight > 0 {
            state.delete_when_idle = true;
        } else if let Err(err) = self.delete_locked(&mut state) {
            self.report_failure(&err);
        }
    }

    /// Delete the index now, regardless of owner shares.
    ///
    /// Second deletion and deletion during a scan both fail with a lifecycle error.
    pub fn delete(&self) -> QueryResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.deleted {
            return Err(self.violation(LifecycleViolation::AlreadyDeleted(self.handle.id())));
        }
        if state.in_flight > 0 {
            return Err(self.violation(LifecycleViolation::InUse(self.handle.id())));
        }
        self.delete_locked(&mut state)?;
        state.owners = 0;
        Ok(())
    }

    /// Register a scan. The index cannot be deleted until the guard drops.
    pub fn begin_scan(self: &Arc<Self>) -> QueryResult<ScanGuard> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.deleted || state.owners == 0 {
            return Err(QueryError::IndexUnavailable(format!(
                "temporary index {} was deleted",
                self.handle.id()
            )));
        }
        state.in_flight += 1;
        Ok(ScanGuard {
            index: Arc::clone(self),
        })
    }

    fn end_scan(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 && state.delete_when_idle && !state.deleted {
            state.delete_when_idle = false;
            if let Err(err) = self.delete_locked(&mut state) {
                self.report_failure(&err);
            }
        }
    }

    fn delete_locked(&self, state: &mut LifecycleState) -> QueryResult<()> {
        self.engine
            .delete_index(&self.handle)
            .map_err(|err| self.violation_from(err.into()))?;
        state.deleted = true;
        self.metrics.increment_temp_indexes_deleted();
        log_event_with_fields(Event::TempIndexDeleted, &[("index", &self.handle.id().to_string())]);
        Ok(())
    }

    fn violation(&self, violation: LifecycleViolation) -> QueryError {
        self.violation_from(violation.into())
    }

    fn violation_from(&self, err: QueryError) -> QueryError {
        if err.is_fatal() {
            self.report_failure(&err);
        }
        err
    }

    fn report_failure(&self, err: &QueryError) {
        log_event_with_fields(
            Event::TempIndexLifecycleViolation,
            &[
                ("index", &self.handle.id().to_string()),
                ("code", err.code()),
                ("error", &err.to_string()),
            ],
        );
    }
}

/// Marks one scan in flight against a temporary index
#[derive(Debug)]
pub struct ScanGuard {
    index: Arc<TemporaryIndex>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.index.end_scan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{map_function, MemoryIndexEngine};

    fn temporary() -> (Arc<MemoryIndexEngine>, Arc<TemporaryIndex>) {
        let engine = MemoryIndexEngine::shared();
        let map = map_function(|doc, emit| emit.emit(doc.id.as_str(), serde_json::Value::Null));
        let tmp = TemporaryIndex::create(engine.clone(), map, Arc::new(MetricsRegistry::new())).unwrap();
        (engine, tmp)
    }

    #[test]
    fn test_last_release_deletes_once() {
        let (engine, tmp) = temporary();
        tmp.acquire_owner().unwrap();
        tmp.release_owner().unwrap();
        assert!(engine.index_exists(tmp.handle().id()));

        tmp.release_owner().unwrap();
        assert!(tmp.is_deleted());
        assert!(!engine.index_exists(tmp.handle().id()));
        assert_eq!(tmp.metrics.snapshot().temp_indexes_deleted, 1);
    }

    #[test]
    fn test_double_release_is_lifecycle_error() {
        let (_engine, tmp) = temporary();
        tmp.release_owner().unwrap();
        let err = tmp.release_owner().unwrap_err();
        assert_eq!(
            err,
            QueryError::Lifecycle(LifecycleViolation::AlreadyDeleted(tmp.handle().id()))
        );
    }

    #[test]
    fn test_release_while_scanning_is_in_use() {
        let (_engine, tmp) = temporary();
        let guard = tmp.begin_scan().unwrap();
        assert_eq!(
            tmp.release_owner().unwrap_err(),
            QueryError::Lifecycle(LifecycleViolation::InUse(tmp.handle().id()))
        );
        assert_eq!(
            tmp.delete().unwrap_err(),
            QueryError::Lifecycle(LifecycleViolation::InUse(tmp.handle().id()))
        );
        drop(guard);
        tmp.release_owner().unwrap();
        assert!(tmp.is_deleted());
    }

    #[test]
    fn test_deferred_release_waits_for_scan() {
        let (engine, tmp) = temporary();
        let guard = tmp.begin_scan().unwrap();
        tmp.release_deferred();
        assert!(!tmp.is_deleted());
        assert!(engine.index_exists(tmp.handle().id()));

        drop(guard);
        assert!(tmp.is_deleted());
        assert!(!engine.index_exists(tmp.handle().id()));
    }

    #[test]
    fn test_scan_after_delete_unavailable() {
        let (_engine, tmp) = temporary();
        tmp.delete().unwrap();
        assert!(matches!(tmp.begin_scan(), Err(QueryError::IndexUnavailable(_))));
        assert!(matches!(tmp.delete(), Err(QueryError::Lifecycle(_))));
    }
}
