//! In-memory reference engine
//!
//! Holds documents, named and ephemeral views, and the change feed in one
//! process. Views are derived state: brought up to date from the write log
//! whenever their indexed generation falls behind the database generation
//! and the request's staleness policy allows a refresh.
//!
//! # Invariants
//!
//! - Every write advances the generation by exactly one
//! - Scans report the generation the scanned view was built at
//! - Subscribers are notified after the write is visible to scans

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};

use super::definition::{
    Document, Emitter, IndexDescriptor, IndexHandle, IndexId, MapFunction, ReduceFunction,
};
use super::engine::{
    ChangeCallback, ChangeFeed, ChangeNotification, IndexEngine, ScanOutput, SubscriptionToken,
};
use super::errors::{IndexError, IndexResult};
use super::key::ViewKey;
use super::request::{AllDocsMode, IndexRequest, IndexStalenessPolicy, IndexTarget, KeySelection};
use super::row::QueryRow;
use super::tree::IndexTree;

struct ViewState {
    descriptor: IndexHandle,
    map: MapFunction,
    reduce: Option<ReduceFunction>,
    tree: IndexTree,
    /// `None` until the first build
    indexed_generation: Option<u64>,
}

#[derive(Default)]
struct EngineState {
    generation: u64,
    documents: BTreeMap<String, Document>,
    views: HashMap<IndexId, ViewState>,
    names: HashMap<String, IndexId>,
    /// generation -> document written at that generation
    change_log: BTreeMap<u64, String>,
}

struct Subscriber {
    index: IndexId,
    callback: ChangeCallback,
}

/// Engine + change feed backed by process memory
#[derive(Default)]
pub struct MemoryIndexEngine {
    state: RwLock<EngineState>,
    subscribers: RwLock<HashMap<SubscriptionToken, Subscriber>>,
    scans: AtomicU64,
}

fn poisoned() -> IndexError {
    IndexError::Internal("Lock poisoned".into())
}

/// Drop log entries every built view has already indexed. Unbuilt views
/// rebuild from the documents and need no log.
fn prune_change_log(change_log: &mut BTreeMap<u64, String>, views: &HashMap<IndexId, ViewState>, generation: u64) {
    let floor = views
        .values()
        .filter_map(|v| v.indexed_generation)
        .min()
        .unwrap_or(generation);
    *change_log = change_log.split_off(&(floor + 1));
}

fn page<T>(items: impl Iterator<Item = T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    items.skip(skip).take(limit.unwrap_or(usize::MAX)).collect()
}

impl MemoryIndexEngine {
    /// Create an empty engine at generation 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared engine, usable as both `IndexEngine` and `ChangeFeed`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Define (or redefine) a named view.
    ///
    /// Redefining a name replaces the view; handles to the old definition
    /// become unavailable.
    pub fn define_view(
        &self,
        name: &str,
        map: MapFunction,
        reduce: Option<ReduceFunction>,
    ) -> IndexResult<IndexHandle> {
        let descriptor = Arc::new(IndexDescriptor::named(name, reduce.is_some()));
        let mut state = self.state.write().map_err(|_| poisoned())?;

        if let Some(old) = state.names.remove(name) {
            state.views.remove(&old);
        }
        state.names.insert(name.to_string(), descriptor.id());
        state.views.insert(
            descriptor.id(),
            ViewState {
                descriptor: Arc::clone(&descriptor),
                map,
                reduce,
                tree: IndexTree::new(),
                indexed_generation: None,
            },
        );
        Ok(descriptor)
    }

    /// Look up a named view
    pub fn view(&self, name: &str) -> Option<IndexHandle> {
        let state = self.state.read().ok()?;
        let id = state.names.get(name)?;
        state.views.get(id).map(|v| Arc::clone(&v.descriptor))
    }

    /// Whether an index (named or ephemeral) currently exists
    pub fn index_exists(&self, id: IndexId) -> bool {
        self.state
            .read()
            .map(|s| s.views.contains_key(&id))
            .unwrap_or(false)
    }

    /// Current database generation
    pub fn generation(&self) -> u64 {
        self.state.read().map(|s| s.generation).unwrap_or(0)
    }

    /// Number of scans performed so far
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    /// Fetch a document, including tombstones
    pub fn document(&self, id: &str) -> Option<Document> {
        self.state.read().ok()?.documents.get(id).cloned()
    }

    /// Create or update a document; returns the new revision id
    pub fn put_document(&self, id: &str, body: Value) -> IndexResult<String> {
        self.write_document(id, |state, generation| {
            let entry = state.documents.entry(id.to_string()).or_insert_with(|| Document {
                id: id.to_string(),
                rev: String::new(),
                body: Value::Null,
                deleted: false,
                conflicts: Vec::new(),
            });
            entry.rev = next_revision(&entry.rev, generation);
            entry.body = body;
            entry.deleted = false;
            Ok(entry.rev.clone())
        })
    }

    /// Mark a document deleted; returns the tombstone revision id
    pub fn delete_document(&self, id: &str) -> IndexResult<String> {
        self.write_document(id, |state, generation| {
            let entry = state
                .documents
                .get_mut(id)
                .filter(|d| !d.deleted)
                .ok_or_else(|| IndexError::Unavailable(format!("document '{}' not found", id)))?;
            entry.rev = next_revision(&entry.rev, generation);
            entry.body = json!({});
            entry.deleted = true;
            Ok(entry.rev.clone())
        })
    }

    /// Record a conflicting (losing) revision, as a replicator would
    pub fn add_conflicting_revision(&self, id: &str, rev: &str) -> IndexResult<()> {
        self.write_document(id, |state, _| {
            let entry = state
                .documents
                .get_mut(id)
                .ok_or_else(|| IndexError::Unavailable(format!("document '{}' not found", id)))?;
            if !entry.conflicts.iter().any(|r| r == rev) {
                entry.conflicts.push(rev.to_string());
            }
            Ok(())
        })
    }

    /// Drop every conflicting revision of a document
    pub fn resolve_conflicts(&self, id: &str) -> IndexResult<()> {
        self.write_document(id, |state, _| {
            let entry = state
                .documents
                .get_mut(id)
                .ok_or_else(|| IndexError::Unavailable(format!("document '{}' not found", id)))?;
            entry.conflicts.clear();
            Ok(())
        })
    }

    /// Apply one write, bump the generation, then notify subscribers outside the locks
    fn write_document<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut EngineState, u64) -> IndexResult<T>,
    ) -> IndexResult<T> {
        let (result, generation) = {
            let mut state = self.state.write().map_err(|_| poisoned())?;
            let generation = state.generation + 1;
            let result = apply(&mut state, generation)?;
            state.generation = generation;
            state.change_log.insert(generation, id.to_string());
            let EngineState { change_log, views, .. } = &mut *state;
            prune_change_log(change_log, views, generation);
            (result, generation)
        };

        self.notify(ChangeNotification {
            generation,
            doc_ids: vec![id.to_string()],
        });
        Ok(result)
    }

    fn notify(&self, notification: ChangeNotification) {
        let live: Vec<ChangeCallback> = {
            let Ok(state) = self.state.read() else {
                return;
            };
            let Ok(subscribers) = self.subscribers.read() else {
                return;
            };
            subscribers
                .values()
                .filter(|s| state.views.contains_key(&s.index))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        for callback in live {
            callback(&notification);
        }
    }

    /// Bring a view up to the database generation.
    ///
    /// Views that were built before are updated from the change log; others
    /// are rebuilt from every live document. A failed update leaves the view
    /// unbuilt so the next refresh starts over.
    fn refresh_view(state: &mut EngineState, id: IndexId) -> IndexResult<()> {
        let EngineState {
            generation,
            documents,
            views,
            change_log,
            ..
        } = state;
        let view = views
            .get_mut(&id)
            .ok_or_else(|| IndexError::Unavailable(format!("index {} not found", id)))?;

        let changed: Vec<&String> = match view.indexed_generation {
            Some(indexed) if indexed == *generation => return Ok(()),
            Some(indexed) => {
                let mut ids: Vec<&String> = change_log.range(indexed + 1..).map(|(_, id)| id).collect();
                ids.sort();
                ids.dedup();
                for doc_id in &ids {
                    view.tree.remove_document(doc_id);
                }
                ids
            }
            None => {
                view.tree.clear();
                documents.keys().collect()
            }
        };
        view.indexed_generation = None;

        for doc in changed
            .into_iter()
            .filter_map(|doc_id| documents.get(doc_id))
            .filter(|d| !d.deleted)
        {
            let mut emitter = Emitter::new();
            let map = &view.map;
            panic::catch_unwind(AssertUnwindSafe(|| map(doc, &mut emitter))).map_err(|_| {
                IndexError::Scan(format!(
                    "map function of {} panicked on document '{}'",
                    view.descriptor, doc.id
                ))
            })?;
            for (key, value) in emitter.into_rows() {
                view.tree.insert(key, &doc.id, value);
            }
        }
        view.indexed_generation = Some(*generation);
        prune_change_log(change_log, views, *generation);
        Ok(())
    }

    fn scan_view(state: &EngineState, id: IndexId, request: &IndexRequest) -> IndexResult<ScanOutput> {
        let view = state
            .views
            .get(&id)
            .ok_or_else(|| IndexError::Unavailable(format!("index {} not found", id)))?;

        let reduce = if request.reduce {
            Some(view.reduce.as_ref().ok_or_else(|| {
                IndexError::Scan(format!(
                    "reduce requested but {} has no reduce function",
                    view.descriptor
                ))
            })?)
        } else {
            None
        };

        let candidates: Vec<(&ViewKey, &str, &Value)> = match &request.selection {
            KeySelection::Keys(keys) => keys
                .iter()
                .flat_map(|key| {
                    let mut rows: Vec<_> = view.tree.entries_for_key(key).collect();
                    if request.descending {
                        rows.reverse();
                    }
                    rows
                })
                .collect(),
            KeySelection::Range(range) => {
                let admit = |(key, doc_id, _): &(&ViewKey, &str, &Value)| {
                    range.contains(key, doc_id, request.descending)
                };
                if request.descending {
                    view.tree.entries().rev().filter(admit).collect()
                } else {
                    view.tree.entries().filter(admit).collect()
                }
            }
        };

        let rows = match reduce {
            Some(reduce) => {
                let groups = group_rows(&candidates, request.group_level, reduce)?;
                page(groups.into_iter(), request.skip, request.limit)
            }
            None => page(candidates.into_iter(), request.skip, request.limit)
                .into_iter()
                .map(|(key, doc_id, value)| {
                    let mut row = QueryRow::mapped(key.clone(), value.clone(), doc_id);
                    if request.include_docs {
                        row.document = state.documents.get(doc_id).map(|d| d.body.clone());
                    }
                    row
                })
                .collect(),
        };

        Ok(ScanOutput {
            rows,
            generation: view.indexed_generation.unwrap_or(0),
        })
    }

    fn scan_all_docs(state: &EngineState, request: &IndexRequest) -> ScanOutput {
        let mode = request.all_docs_mode;
        let visible = |doc: &Document| match mode {
            AllDocsMode::All | AllDocsMode::ShowConflicts => !doc.deleted,
            AllDocsMode::IncludeDeleted => true,
            AllDocsMode::OnlyConflicts => !doc.deleted && doc.is_conflicted(),
        };

        let docs: Vec<&Document> = match &request.selection {
            KeySelection::Keys(keys) => keys
                .iter()
                .filter_map(|k| k.as_str())
                .filter_map(|id| state.documents.get(id))
                .filter(|d| visible(d))
                .collect(),
            KeySelection::Range(range) => {
                let admit = |doc: &&Document| {
                    visible(doc)
                        && range.contains(&ViewKey::string(doc.id.as_str()), &doc.id, request.descending)
                };
                if request.descending {
                    state.documents.values().rev().filter(admit).collect()
                } else {
                    state.documents.values().filter(admit).collect()
                }
            }
        };

        let rows = page(docs.into_iter(), request.skip, request.limit)
            .into_iter()
            .map(|doc| {
                let mut value = json!({ "rev": doc.rev });
                if doc.deleted {
                    value["deleted"] = Value::Bool(true);
                }
                let mut row = QueryRow::mapped(ViewKey::string(doc.id.as_str()), value, doc.id.as_str());
                if request.include_docs && !doc.deleted {
                    row.document = Some(doc.body.clone());
                }
                if matches!(mode, AllDocsMode::ShowConflicts | AllDocsMode::OnlyConflicts) {
                    row.conflicting_revisions = Some(doc.conflicts.clone());
                }
                row
            })
            .collect();

        ScanOutput {
            rows,
            generation: state.generation,
        }
    }
}

/// Revision ids are `<n>-<generation hex>`
fn next_revision(previous: &str, generation: u64) -> String {
    let n = previous
        .split('-')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{:08x}", n + 1, generation)
}

/// Reduce contiguous runs sharing a `group_level` key prefix.
/// Level 0 folds everything into one row keyed `null`.
fn group_rows(
    candidates: &[(&ViewKey, &str, &Value)],
    group_level: u32,
    reduce: &ReduceFunction,
) -> IndexResult<Vec<QueryRow>> {
    let mut groups: Vec<(ViewKey, Vec<ViewKey>, Vec<Value>)> = Vec::new();

    for (key, _, value) in candidates {
        let group_key = if group_level == 0 {
            ViewKey::Null
        } else {
            key.group_prefix(group_level)
        };
        match groups.last_mut() {
            Some((current, keys, values)) if *current == group_key => {
                keys.push((*key).clone());
                values.push((*value).clone());
            }
            _ => groups.push((group_key, vec![(*key).clone()], vec![(*value).clone()])),
        }
    }

    groups
        .into_iter()
        .map(|(group_key, keys, values)| {
            let reduced = panic::catch_unwind(AssertUnwindSafe(|| reduce(&keys, &values)))
                .map_err(|_| IndexError::Scan(format!("reduce function panicked on group {}", group_key)))?;
            Ok(QueryRow::reduced(group_key, reduced))
        })
        .collect()
}

impl IndexEngine for MemoryIndexEngine {
    fn scan(&self, request: &IndexRequest) -> IndexResult<ScanOutput> {
        self.scans.fetch_add(1, Ordering::SeqCst);

        let id = match request.target {
            IndexTarget::AllDocs => {
                let state = self.state.read().map_err(|_| poisoned())?;
                return Ok(Self::scan_all_docs(&state, request));
            }
            IndexTarget::Index(id) => id,
        };

        if request.stale == IndexStalenessPolicy::RefreshBefore {
            let mut state = self.state.write().map_err(|_| poisoned())?;
            Self::refresh_view(&mut state, id)?;
        }

        let output = {
            let state = self.state.read().map_err(|_| poisoned())?;
            Self::scan_view(&state, id, request)?
        };

        if request.stale == IndexStalenessPolicy::RefreshAfter {
            let mut state = self.state.write().map_err(|_| poisoned())?;
            Self::refresh_view(&mut state, id)?;
        }

        Ok(output)
    }

    fn create_ephemeral_index(&self, map: MapFunction) -> IndexResult<IndexHandle> {
        let descriptor = Arc::new(IndexDescriptor::ephemeral());
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.views.insert(
            descriptor.id(),
            ViewState {
                descriptor: Arc::clone(&descriptor),
                map,
                reduce: None,
                tree: IndexTree::new(),
                indexed_generation: None,
            },
        );
        Ok(descriptor)
    }

    fn delete_index(&self, index: &IndexDescriptor) -> IndexResult<()> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if !state.views.contains_key(&index.id()) {
            return Err(IndexError::AlreadyDeleted(index.id()));
        }

        let subscribed = self
            .subscribers
            .read()
            .map_err(|_| poisoned())?
            .values()
            .any(|s| s.index == index.id());
        if subscribed {
            return Err(IndexError::InUse(index.id()));
        }

        state.views.remove(&index.id());
        if let Some(name) = index.name() {
            if state.names.get(name) == Some(&index.id()) {
                state.names.remove(name);
            }
        }
        Ok(())
    }
}

impl ChangeFeed for MemoryIndexEngine {
    fn subscribe(&self, index: &IndexDescriptor, callback: ChangeCallback) -> IndexResult<SubscriptionToken> {
        // Held across the insert; delete_index checks subscribers under the write lock
        let state = self.state.read().map_err(|_| poisoned())?;
        if !state.views.contains_key(&index.id()) {
            return Err(IndexError::Unavailable(format!("index {} not found", index)));
        }
        let token = SubscriptionToken::new();
        self.subscribers.write().map_err(|_| poisoned())?.insert(
            token,
            Subscriber {
                index: index.id(),
                callback,
            },
        );
        Ok(token)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.remove(&token);
        }
    }
}
