//! QuerySpec: the mutable description of one view query
//!
//! Pure data plus setter-level normalization. Nothing here talks to the
//! index engine except the execution shortcuts, which forward to the
//! database's dispatcher.
//!
//! # Concurrency
//!
//! A spec follows a single-writer discipline: mutating it while one of its
//! executions is being submitted is the caller's responsibility. Executions
//! snapshot the spec when they are submitted.

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::index::{AllDocsMode, IndexHandle, IndexStalenessPolicy, ViewKey};
use crate::observability::{log_event_with_fields, Event};

use super::dispatcher::CancelHandle;
use super::enumerator::QueryEnumerator;
use super::errors::{LifecycleViolation, QueryError, QueryResult};
use super::lifecycle::{ScanGuard, TemporaryIndex};
use super::live::LiveQuery;

/// Generation observed by the most recent execution of one spec
#[derive(Debug, Default)]
pub(crate) struct GenerationTracker(Mutex<Option<u64>>);

impl GenerationTracker {
    pub(crate) fn get(&self) -> Option<u64> {
        self.0.lock().ok().and_then(|g| *g)
    }

    pub(crate) fn set(&self, generation: u64) {
        if let Ok(mut g) = self.0.lock() {
            *g = Some(generation);
        }
    }
}

/// Parameters of a view query against a named index, an ephemeral index,
/// or the built-in full-document enumeration (`index == None`)
#[derive(Debug)]
pub struct QuerySpec {
    database: Database,
    index: Option<IndexHandle>,
    temporary: Option<Arc<TemporaryIndex>>,
    is_temporary: bool,
    skip: usize,
    limit: Option<usize>,
    start_key: Option<ViewKey>,
    end_key: Option<ViewKey>,
    start_key_doc_id: Option<String>,
    end_key_doc_id: Option<String>,
    keys: Option<Vec<ViewKey>>,
    descending: bool,
    group_level: u32,
    map_only: bool,
    all_docs_mode: AllDocsMode,
    stale: IndexStalenessPolicy,
    prefetch: bool,
    last_executed_generation: Arc<GenerationTracker>,
    disposed: bool,
}

impl QuerySpec {
    pub(crate) fn new(
        database: Database,
        index: Option<IndexHandle>,
        temporary: Option<Arc<TemporaryIndex>>,
    ) -> Self {
        let map_only = index.as_ref().map_or(true, |i| !i.has_reduce());
        Self {
            database,
            index,
            is_temporary: temporary.is_some(),
            temporary,
            skip: 0,
            limit: None,
            start_key: None,
            end_key: None,
            start_key_doc_id: None,
            end_key_doc_id: None,
            keys: None,
            descending: false,
            group_level: 0,
            map_only,
            all_docs_mode: AllDocsMode::All,
            stale: IndexStalenessPolicy::RefreshBefore,
            prefetch: false,
            last_executed_generation: Arc::new(GenerationTracker::default()),
            disposed: false,
        }
    }

    /// Copy another spec.
    ///
    /// The copy shares the index (and takes its own share of a temporary
    /// index) but owns independent copies of every parameter.
    pub fn copy_from(other: &QuerySpec) -> QueryResult<QuerySpec> {
        if other.disposed {
            return Err(QueryError::Validation("cannot copy a disposed query".into()));
        }
        if let Some(temporary) = &other.temporary {
            temporary.acquire_owner()?;
        }

        let generation = Arc::new(GenerationTracker::default());
        if let Some(g) = other.last_executed_generation() {
            generation.set(g);
        }

        Ok(QuerySpec {
            database: other.database.clone(),
            index: other.index.clone(),
            temporary: other.temporary.clone(),
            is_temporary: other.is_temporary,
            skip: other.skip,
            limit: other.limit,
            start_key: other.start_key.clone(),
            end_key: other.end_key.clone(),
            start_key_doc_id: other.start_key_doc_id.clone(),
            end_key_doc_id: other.end_key_doc_id.clone(),
            keys: other.keys.clone(),
            descending: other.descending,
            group_level: other.group_level,
            map_only: other.map_only,
            all_docs_mode: other.all_docs_mode,
            stale: other.stale,
            prefetch: other.prefetch,
            last_executed_generation: generation,
            disposed: false,
        })
    }

    // ==================
    // Identity
    // ==================

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Target index; `None` means the built-in full-document enumeration
    pub fn index(&self) -> Option<&IndexHandle> {
        self.index.as_ref()
    }

    /// Whether the index was created solely for this query family
    pub fn is_temporary_index(&self) -> bool {
        self.is_temporary
    }

    /// Lifetime record of the temporary index, if any and not yet released
    pub fn temporary_index(&self) -> Option<&Arc<TemporaryIndex>> {
        self.temporary.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ==================
    // Paging
    // ==================

    pub fn skip(&self) -> usize {
        self.skip
    }

    pub fn set_skip(&mut self, skip: usize) {
        self.skip = skip;
    }

    /// `None` is unbounded
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// `Some(0)` yields zero rows; `None` removes the bound
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    // ==================
    // Key selection
    // ==================

    pub fn start_key(&self) -> Option<&ViewKey> {
        self.start_key.as_ref()
    }

    pub fn set_start_key(&mut self, key: Option<ViewKey>) {
        self.start_key = key;
    }

    pub fn end_key(&self) -> Option<&ViewKey> {
        self.end_key.as_ref()
    }

    pub fn set_end_key(&mut self, key: Option<ViewKey>) {
        self.end_key = key;
    }

    pub fn start_key_doc_id(&self) -> Option<&str> {
        self.start_key_doc_id.as_deref()
    }

    pub fn set_start_key_doc_id(&mut self, doc_id: Option<String>) {
        self.start_key_doc_id = doc_id;
    }

    pub fn end_key_doc_id(&self) -> Option<&str> {
        self.end_key_doc_id.as_deref()
    }

    pub fn set_end_key_doc_id(&mut self, doc_id: Option<String>) {
        self.end_key_doc_id = doc_id;
    }

    /// Explicit keys; when set, range bounds are not applied
    pub fn keys(&self) -> Option<&[ViewKey]> {
        self.keys.as_deref()
    }

    pub fn set_keys(&mut self, keys: Option<Vec<ViewKey>>) {
        self.keys = keys;
    }

    pub fn descending(&self) -> bool {
        self.descending
    }

    /// Reverse iteration order. `start_key` stays the bound reached first.
    pub fn set_descending(&mut self, descending: bool) {
        self.descending = descending;
    }

    // ==================
    // Reduction
    // ==================

    pub fn group_level(&self) -> u32 {
        self.group_level
    }

    /// Group reduced rows by a key prefix of this length; ignored when map-only
    pub fn set_group_level(&mut self, group_level: u32) {
        self.group_level = group_level;
    }

    pub fn map_only(&self) -> bool {
        self.map_only
    }

    pub fn set_map_only(&mut self, map_only: bool) {
        self.map_only = map_only;
    }

    // ==================
    // Enumeration and freshness
    // ==================

    pub fn all_docs_mode(&self) -> AllDocsMode {
        self.all_docs_mode
    }

    pub fn set_all_docs_mode(&mut self, mode: AllDocsMode) {
        self.all_docs_mode = mode;
    }

    /// Whether the built-in enumeration includes deleted documents
    pub fn include_deleted(&self) -> bool {
        self.all_docs_mode == AllDocsMode::IncludeDeleted
    }

    pub fn set_include_deleted(&mut self, include_deleted: bool) {
        self.all_docs_mode = if include_deleted {
            AllDocsMode::IncludeDeleted
        } else {
            AllDocsMode::All
        };
    }

    pub fn stale(&self) -> IndexStalenessPolicy {
        self.stale
    }

    pub fn set_stale(&mut self, stale: IndexStalenessPolicy) {
        self.stale = stale;
    }

    /// Whether rows carry full document bodies
    pub fn prefetch(&self) -> bool {
        self.prefetch
    }

    pub fn set_prefetch(&mut self, prefetch: bool) {
        self.prefetch = prefetch;
    }

    /// Generation observed by the most recent successful execution
    pub fn last_executed_generation(&self) -> Option<u64> {
        self.last_executed_generation.get()
    }

    pub(crate) fn generation_tracker(&self) -> Arc<GenerationTracker> {
        Arc::clone(&self.last_executed_generation)
    }

    // ==================
    // Execution
    // ==================

    /// Run on the calling thread
    pub fn run_sync(&self) -> QueryResult<QueryEnumerator> {
        self.database.dispatcher().run_sync(self)
    }

    /// Run in the background; `on_complete` receives the rows or the error
    pub fn run_async<F>(&self, on_complete: F) -> CancelHandle
    where
        F: FnOnce(QueryResult<QueryEnumerator>) + Send + 'static,
    {
        self.database.dispatcher().run_async(self, on_complete)
    }

    /// Derive a live query from a snapshot of this spec
    pub fn to_live_query(&self) -> QueryResult<LiveQuery> {
        LiveQuery::from_spec(self)
    }

    /// Register a scan against this spec's index
    pub(crate) fn begin_scan(&self) -> QueryResult<Option<ScanGuard>> {
        if self.disposed {
            return Err(if self.is_temporary {
                QueryError::IndexUnavailable("temporary index was released by a disposed query".into())
            } else {
                QueryError::Validation("query was disposed".into())
            });
        }
        self.temporary.as_ref().map(|t| t.begin_scan()).transpose()
    }

    // ==================
    // Disposal
    // ==================

    /// Release this spec's share of its temporary index.
    ///
    /// The last release deletes the index. Disposing twice, or disposing the
    /// last share while a query against the index is in flight, is a
    /// lifecycle error.
    pub fn dispose(&mut self) -> QueryResult<()> {
        if self.disposed {
            return match &self.index {
                Some(index) if self.is_temporary => {
                    Err(LifecycleViolation::AlreadyDeleted(index.id()).into())
                }
                _ => Ok(()),
            };
        }

        if let Some(temporary) = &self.temporary {
            temporary.release_owner()?;
        }
        self.temporary = None;
        self.disposed = true;
        Ok(())
    }

    /// Release without failing; deletion waits for in-flight scans
    pub(crate) fn release_deferred(&mut self) {
        if let Some(temporary) = self.temporary.take() {
            temporary.release_deferred();
        }
        self.disposed = true;
    }
}

impl Drop for QuerySpec {
    fn drop(&mut self) {
        if let Some(temporary) = &self.temporary {
            log_event_with_fields(
                Event::TempIndexReleasedOnDrop,
                &[
                    ("index", &temporary.handle().id().to_string()),
                    ("reason", "query dropped without dispose"),
                ],
            );
        }
        self.release_deferred();
    }
}
