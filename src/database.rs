//! Database handle
//!
//! Owns the engine and change feed references, the shared dispatcher, the
//! metrics registry and the configuration. Cloning is cheap; every clone
//! refers to the same database.

use std::sync::Arc;

use crate::config::AeroviewConfig;
use crate::index::{ChangeFeed, IndexEngine, IndexHandle, MapFunction, MemoryIndexEngine};
use crate::observability::{MetricsRegistry, MetricsSnapshot};
use crate::query::{ExecutionDispatcher, QueryResult, QuerySpec, TemporaryIndex};

struct DatabaseInner {
    engine: Arc<dyn IndexEngine>,
    feed: Arc<dyn ChangeFeed>,
    memory: Option<Arc<MemoryIndexEngine>>,
    dispatcher: ExecutionDispatcher,
    metrics: Arc<MetricsRegistry>,
    config: AeroviewConfig,
}

/// Shared handle to one database
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a handle over an engine and its change feed
    pub fn new(
        engine: Arc<dyn IndexEngine>,
        feed: Arc<dyn ChangeFeed>,
        config: AeroviewConfig,
    ) -> QueryResult<Self> {
        Self::build(engine, feed, None, config)
    }

    /// Create a handle backed by a fresh [`MemoryIndexEngine`]
    pub fn in_memory(config: AeroviewConfig) -> QueryResult<Self> {
        let engine = MemoryIndexEngine::shared();
        Self::build(engine.clone(), engine.clone(), Some(engine), config)
    }

    fn build(
        engine: Arc<dyn IndexEngine>,
        feed: Arc<dyn ChangeFeed>,
        memory: Option<Arc<MemoryIndexEngine>>,
        config: AeroviewConfig,
    ) -> QueryResult<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = ExecutionDispatcher::new(Arc::clone(&engine), &config.dispatch, Arc::clone(&metrics));
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                engine,
                feed,
                memory,
                dispatcher,
                metrics,
                config,
            }),
        })
    }

    /// Query a named, pre-existing index
    pub fn create_query(&self, index: IndexHandle) -> QuerySpec {
        QuerySpec::new(self.clone(), Some(index), None)
    }

    /// Query the built-in full-document enumeration
    pub fn create_all_documents_query(&self) -> QuerySpec {
        QuerySpec::new(self.clone(), None, None)
    }

    /// Query an ad-hoc map function through a new ephemeral index.
    ///
    /// The index lives until the returned spec, its copies and any live
    /// queries derived from them are all disposed or dropped.
    pub fn slow_query(&self, map: MapFunction) -> QueryResult<QuerySpec> {
        let temporary = TemporaryIndex::create(
            Arc::clone(&self.inner.engine),
            map,
            Arc::clone(&self.inner.metrics),
        )?;
        let handle = Arc::clone(temporary.handle());
        Ok(QuerySpec::new(self.clone(), Some(handle), Some(temporary)))
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.inner.engine
    }

    pub fn change_feed(&self) -> &Arc<dyn ChangeFeed> {
        &self.inner.feed
    }

    /// The in-memory engine, when this handle was built with [`Database::in_memory`]
    pub fn memory_engine(&self) -> Option<&Arc<MemoryIndexEngine>> {
        self.inner.memory.as_ref()
    }

    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &AeroviewConfig {
        &self.inner.config
    }

    pub(crate) fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    /// Point-in-time copy of this database's counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Whether two handles refer to the same database
    pub fn same_database(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::index::map_function;
    use crate::query::QueryError;

    #[test]
    fn test_in_memory_exposes_engine() {
        let db = Database::in_memory(AeroviewConfig::default()).unwrap();
        assert!(db.memory_engine().is_some());
        assert!(db.same_database(&db.clone()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AeroviewConfig {
            dispatch: DispatchConfig { max_concurrent_scans: 0 },
            ..Default::default()
        };
        assert!(matches!(Database::in_memory(config), Err(QueryError::Validation(_))));
    }

    #[test]
    fn test_slow_query_creates_ephemeral_index() {
        let db = Database::in_memory(AeroviewConfig::default()).unwrap();
        let spec = db
            .slow_query(map_function(|doc, emit| emit.emit(doc.id.as_str(), serde_json::Value::Null)))
            .unwrap();
        assert!(spec.is_temporary_index());
        assert!(spec.index().map(|i| i.is_ephemeral()).unwrap_or(false));
        assert_eq!(db.metrics().temp_indexes_created, 1);
    }

    #[test]
    fn test_entry_points() {
        let db = Database::in_memory(AeroviewConfig::default()).unwrap();
        let engine = db.memory_engine().unwrap();
        let view = engine
            .define_view("by_id", map_function(|doc, emit| emit.emit(doc.id.as_str(), serde_json::Value::Null)), None)
            .unwrap();

        assert!(db.create_query(view).index().is_some());
        assert!(db.create_all_documents_query().index().is_none());
    }
}
