//! Live queries
//!
//! A live query owns a snapshot copy of a spec, subscribes to the change feed
//! for its index and re-runs itself when the index changes.
//!
//! # State machine
//!
//! ```text
//! Stopped --start--> AwaitingInitial --result--> Idle --change--> Requerying --result--> Idle
//!    ^                                                                              |
//!    +------------------------------------ stop ------------------------------------+
//! ```
//!
//! Changes arriving while a run is pending or in progress set a single
//! `rerun_pending` slot; however many arrive, at most one extra run follows.
//!
//! # Delivery
//!
//! Listener callbacks run under a delivery gate. `stop()` advances the epoch
//! and then passes through the gate, so once it returns no callback is running
//! and none can start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::database::Database;
use crate::index::{ChangeCallback, ChangeNotification, IndexHandle, SubscriptionToken};
use crate::observability::{log_event_with_fields, Event};

use super::dispatcher::CancelHandle;
use super::enumerator::QueryEnumerator;
use super::errors::{QueryError, QueryResult};
use super::spec::QuerySpec;

/// What a listener is told after a refresh
#[derive(Debug, Clone)]
pub struct LiveQueryChange {
    /// Latest good rows; kept across failed refreshes
    pub rows: Option<QueryEnumerator>,
    /// Failure of the refresh that triggered this change
    pub error: Option<QueryError>,
}

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Listener = Arc<dyn Fn(&LiveQueryChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    AwaitingInitial { rerun_pending: bool },
    Idle,
    Requerying { rerun_pending: bool },
}

struct LiveState {
    phase: Phase,
    /// Advanced by start and stop; stale tasks and notifications compare against it
    epoch: u64,
    token: Option<SubscriptionToken>,
    runtime: Option<Handle>,
    running: Option<CancelHandle>,
    rows: Option<QueryEnumerator>,
    last_error: Option<QueryError>,
}

struct LiveInner {
    database: Database,
    index: IndexHandle,
    spec: Mutex<QuerySpec>,
    update_interval: Duration,
    state: Mutex<LiveState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    delivery: Mutex<()>,
    delivering: Mutex<Option<ThreadId>>,
    results: watch::Sender<Option<QueryResult<QueryEnumerator>>>,
    disposed: AtomicBool,
}

/// A continuously refreshed view over one index
pub struct LiveQuery {
    inner: Arc<LiveInner>,
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("index", &self.inner.index)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn poisoned() -> QueryError {
    QueryError::Internal("Live query lock poisoned".into())
}

impl LiveQuery {
    /// Derive a live query from a snapshot of `spec`.
    ///
    /// Fails with `InvalidConversion` for the built-in enumeration, which has
    /// no index for the change feed to key on.
    pub fn from_spec(spec: &QuerySpec) -> QueryResult<LiveQuery> {
        let index = spec.index().cloned().ok_or_else(|| {
            QueryError::InvalidConversion(
                "live queries need an index; the built-in document enumeration has none".into(),
            )
        })?;
        let copy = QuerySpec::copy_from(spec)?;
        let database = spec.database().clone();
        let update_interval = database.config().live_query.update_interval();
        let (results, _) = watch::channel(None);

        Ok(LiveQuery {
            inner: Arc::new(LiveInner {
                database,
                index,
                spec: Mutex::new(copy),
                update_interval,
                state: Mutex::new(LiveState {
                    phase: Phase::Stopped,
                    epoch: 0,
                    token: None,
                    runtime: None,
                    running: None,
                    rows: None,
                    last_error: None,
                }),
                listeners: Mutex::new(Vec::new()),
                delivery: Mutex::new(()),
                delivering: Mutex::new(None),
                results,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Run immediately and re-run on every relevant change.
    ///
    /// Refreshes run on the caller's tokio runtime, or on the dispatcher's
    /// background runtime when called outside one. Starting a running query is a no-op.
    pub fn start(&self) -> QueryResult<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(QueryError::Validation("live query was disposed".into()));
        }
        let runtime = self.inner.database.dispatcher().runtime()?;

        let mut state = self.inner.state.lock().map_err(|_| poisoned())?;
        if state.phase != Phase::Stopped {
            return Ok(());
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let weak: Weak<LiveInner> = Arc::downgrade(&self.inner);
        let callback: ChangeCallback = Arc::new(move |change: &ChangeNotification| {
            if let Some(inner) = weak.upgrade() {
                inner.on_change(change, epoch);
            }
        });
        let token = self.inner.database.change_feed().subscribe(&self.inner.index, callback)?;

        state.token = Some(token);
        state.runtime = Some(runtime);
        state.phase = Phase::AwaitingInitial { rerun_pending: false };
        self.inner.launch(&state, Duration::ZERO);

        log_event_with_fields(Event::LiveQueryStarted, &[("index", &self.inner.index.to_string())]);
        Ok(())
    }

    /// Unsubscribe and stop refreshing.
    ///
    /// No listener callback runs after this returns, unless `stop` is called
    /// from inside a listener, in which case only the current callback finishes.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop and release this live query's share of a temporary index
    pub fn dispose(&self) -> QueryResult<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.stop();
        self.inner.spec.lock().map_err(|_| poisoned())?.release_deferred();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.phase != Phase::Stopped)
            .unwrap_or(false)
    }

    /// Latest successful result
    pub fn rows(&self) -> Option<QueryEnumerator> {
        self.inner.state.lock().ok().and_then(|s| s.rows.clone())
    }

    /// Failure of the most recent refresh, cleared by the next success
    pub fn last_error(&self) -> Option<QueryError> {
        self.inner.state.lock().ok().and_then(|s| s.last_error.clone())
    }

    /// Wait for the first result (or the failure of the first run)
    pub async fn wait_for_rows(&self) -> QueryResult<QueryEnumerator> {
        let mut receiver = self.inner.results.subscribe();
        let result = receiver
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| QueryError::Internal("live query dropped".into()))?;
        result.clone().unwrap_or(Err(QueryError::Internal("live query produced no result".into())))
    }

    pub fn add_change_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LiveQueryChange) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Returns false if the listener was not registered
    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.inner.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Generation of the most recent run
    pub fn last_executed_generation(&self) -> Option<u64> {
        self.inner
            .spec
            .lock()
            .ok()
            .and_then(|s| s.last_executed_generation())
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl LiveInner {
    /// Schedule one run for the current epoch
    fn launch(self: &Arc<Self>, state: &LiveState, delay: Duration) {
        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        let inner = Arc::clone(self);
        let epoch = state.epoch;
        runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.execute(epoch).await;
        });
    }

    async fn execute(self: Arc<Self>, epoch: u64) {
        let pending = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.epoch != epoch || state.phase == Phase::Stopped {
                return;
            }
            let Ok(spec) = self.spec.lock() else {
                return;
            };
            let pending = self.database.dispatcher().submit(&spec);
            state.running = Some(pending.cancel_handle());
            pending
        };

        let result = pending.wait().await;
        self.finish(epoch, result);
    }

    fn on_change(self: &Arc<Self>, change: &ChangeNotification, epoch: u64) {
        let last = self.spec.lock().ok().and_then(|s| s.last_executed_generation());
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.epoch != epoch {
            return;
        }

        match state.phase {
            Phase::Stopped => {}
            Phase::Idle => {
                if last.map_or(false, |g| change.generation <= g) {
                    return;
                }
                state.phase = Phase::Requerying { rerun_pending: false };
                self.launch(&state, self.update_interval);
            }
            Phase::AwaitingInitial { rerun_pending } | Phase::Requerying { rerun_pending } => {
                if rerun_pending {
                    self.database.metrics_registry().increment_live_triggers_coalesced();
                    return;
                }
                state.phase = match state.phase {
                    Phase::AwaitingInitial { .. } => Phase::AwaitingInitial { rerun_pending: true },
                    _ => Phase::Requerying { rerun_pending: true },
                };
            }
        }
    }

    fn finish(self: &Arc<Self>, epoch: u64, result: QueryResult<QueryEnumerator>) {
        let Ok(_gate) = self.delivery.lock() else {
            return;
        };

        let change = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.epoch != epoch || state.phase == Phase::Stopped {
                return;
            }
            state.running = None;

            let rerun = matches!(
                state.phase,
                Phase::AwaitingInitial { rerun_pending: true } | Phase::Requerying { rerun_pending: true }
            );
            let change = self.apply(&mut state, result);

            if rerun {
                state.phase = Phase::Requerying { rerun_pending: false };
                self.launch(&state, self.update_interval);
            } else {
                state.phase = Phase::Idle;
            }
            change
        };

        if let Some(change) = change {
            self.deliver(&change);
        }
    }

    /// Fold one run's outcome into the state; returns the change to deliver, if any
    fn apply(&self, state: &mut LiveState, result: QueryResult<QueryEnumerator>) -> Option<LiveQueryChange> {
        match result {
            Ok(rows) => {
                state.last_error = None;
                self.database.metrics_registry().increment_live_refreshes();
                let unchanged = state.rows.as_ref().map_or(false, |old| old.same_rows(&rows));
                if unchanged {
                    return None;
                }
                log_event_with_fields(
                    Event::LiveQueryRefreshed,
                    &[
                        ("index", &self.index.to_string()),
                        ("rows", &rows.len().to_string()),
                        ("generation", &rows.generation().to_string()),
                    ],
                );
                state.rows = Some(rows.clone());
                self.results.send_replace(Some(Ok(rows.clone())));
                Some(LiveQueryChange {
                    rows: Some(rows),
                    error: None,
                })
            }
            Err(QueryError::Cancelled) => None,
            Err(err) => {
                log_event_with_fields(
                    Event::LiveQueryRefreshFailed,
                    &[("index", &self.index.to_string()), ("error", &err.to_string())],
                );
                state.last_error = Some(err.clone());
                if state.rows.is_none() {
                    self.results.send_replace(Some(Err(err.clone())));
                }
                Some(LiveQueryChange {
                    rows: state.rows.clone(),
                    error: Some(err),
                })
            }
        }
    }

    /// Call listeners; the caller holds the delivery gate
    fn deliver(&self, change: &LiveQueryChange) {
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };

        if let Ok(mut delivering) = self.delivering.lock() {
            *delivering = Some(thread::current().id());
        }
        for listener in listeners {
            listener(change);
        }
        if let Ok(mut delivering) = self.delivering.lock() {
            *delivering = None;
        }
    }

    fn stop(&self) {
        let token = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.phase == Phase::Stopped {
                return;
            }
            state.epoch += 1;
            state.phase = Phase::Stopped;
            state.runtime = None;
            if let Some(running) = state.running.take() {
                running.cancel();
            }
            state.token.take()
        };

        if let Some(token) = token {
            self.database.change_feed().unsubscribe(token);
        }

        let inside_listener = self
            .delivering
            .lock()
            .map(|d| *d == Some(thread::current().id()))
            .unwrap_or(false);
        if !inside_listener {
            drop(self.delivery.lock());
        }

        log_event_with_fields(Event::LiveQueryStopped, &[("index", &self.index.to_string())]);
    }
}
