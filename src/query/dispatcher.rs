//! # Execution Dispatcher
//!
//! Runs query specs against the index engine, on the caller's thread or as
//! a cancellable background task.
//!
//! ## Async delivery
//! - `on_complete` runs on a runtime worker, never on the caller's stack
//! - Exactly once, unless cancelled before the task started (then never)
//! - Cancelled after start: the scan finishes, its rows are discarded and
//!   `on_complete` receives `QueryError::Cancelled`
//!
//! Background scans run on the blocking pool, at most
//! `max_concurrent_scans` at a time. Submissions made inside a tokio runtime
//! use it; all others go to a process-wide runtime started on first use.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, Semaphore};

use crate::config::DispatchConfig;
use crate::index::{IndexEngine, IndexError, IndexRequest, IndexResult, IndexTarget, ScanOutput};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

use super::enumerator::QueryEnumerator;
use super::errors::{QueryError, QueryResult};
use super::options::translate;
use super::spec::{GenerationTracker, QuerySpec};

/// Shared by every dispatcher; never shut down, so queued work always completes
static BACKGROUND: OnceLock<Runtime> = OnceLock::new();

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

/// Cancellation handle for one background execution
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Request cancellation. Returns false if the execution already completed.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                self.state
                    .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            })
            .is_ok()
            || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the result was delivered
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns false if the execution was cancelled while running
    fn try_finish(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Future-style result of [`ExecutionDispatcher::submit`]
#[derive(Debug)]
pub struct PendingQuery {
    receiver: oneshot::Receiver<QueryResult<QueryEnumerator>>,
    cancel: CancelHandle,
}

impl PendingQuery {
    /// Wait for the result. Resolves to `Cancelled` if the task never started.
    pub async fn wait(self) -> QueryResult<QueryEnumerator> {
        self.receiver.await.unwrap_or(Err(QueryError::Cancelled))
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Runs specs against one engine
pub struct ExecutionDispatcher {
    engine: Arc<dyn IndexEngine>,
    permits: Arc<Semaphore>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl ExecutionDispatcher {
    pub fn new(engine: Arc<dyn IndexEngine>, config: &DispatchConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(config.max_concurrent_scans.max(1))),
            metrics,
        }
    }

    /// Execute on the calling thread
    pub fn run_sync(&self, spec: &QuerySpec) -> QueryResult<QueryEnumerator> {
        let guard = spec.begin_scan()?;
        let request = translate(spec);
        let result = self.engine.scan(&request);
        drop(guard);
        complete(result, &request, &spec.generation_tracker(), &self.metrics)
    }

    /// Execute in the background.
    ///
    /// The spec is snapshotted now; later mutation does not affect this run.
    pub fn run_async<F>(&self, spec: &QuerySpec, on_complete: F) -> CancelHandle
    where
        F: FnOnce(QueryResult<QueryEnumerator>) + Send + 'static,
    {
        let cancel = CancelHandle::new();
        let request = translate(spec);
        let guard = spec.begin_scan();
        let tracker = spec.generation_tracker();
        self.metrics.increment_queries_submitted();
        log_event_with_fields(Event::QuerySubmitted, &[("target", &target_label(&request))]);

        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(err) => {
                let task = cancel.clone();
                std::thread::spawn(move || {
                    if task.try_start() && task.try_finish() {
                        on_complete(Err(err));
                    }
                });
                return cancel;
            }
        };

        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let metrics = Arc::clone(&self.metrics);
        let task = cancel.clone();

        runtime.spawn(async move {
            let permit = permits.acquire_owned().await;

            if !task.try_start() {
                metrics.increment_queries_cancelled();
                log_event_with_fields(Event::QueryCancelled, &[("stage", "before_start")]);
                return;
            }

            let outcome = match (permit, guard) {
                (Err(_), _) => Err(QueryError::Internal("dispatcher shut down".into())),
                (_, Err(err)) => {
                    metrics.increment_queries_failed();
                    Err(err)
                }
                (Ok(permit), Ok(guard)) => {
                    let scan_request = request.clone();
                    let scanned = tokio::task::spawn_blocking(move || {
                        let result = engine.scan(&scan_request);
                        drop(guard);
                        result
                    })
                    .await
                    .unwrap_or_else(|e| Err(IndexError::Internal(format!("scan task failed: {}", e))));
                    drop(permit);
                    Ok(scanned)
                }
            };

            if task.try_finish() {
                on_complete(outcome.and_then(|scanned| complete(scanned, &request, &tracker, &metrics)));
            } else {
                metrics.increment_queries_cancelled();
                log_event_with_fields(Event::QueryCancelled, &[("stage", "after_start")]);
                on_complete(Err(QueryError::Cancelled));
            }
        });

        cancel
    }

    /// Execute in the background and await the result
    pub fn submit(&self, spec: &QuerySpec) -> PendingQuery {
        let (sender, receiver) = oneshot::channel();
        let cancel = self.run_async(spec, move |result| {
            let _ = sender.send(result);
        });
        PendingQuery { receiver, cancel }
    }

    /// Background scan slots currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// The caller's runtime, or the shared background one
    pub(crate) fn runtime(&self) -> QueryResult<Handle> {
        background_runtime()
    }
}

fn background_runtime() -> QueryResult<Handle> {
    if let Ok(current) = Handle::try_current() {
        return Ok(current);
    }
    if let Some(runtime) = BACKGROUND.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .thread_name("aeroview-dispatch")
        .enable_all()
        .build()
        .map_err(|e| QueryError::Internal(format!("failed to start dispatch runtime: {}", e)))?;
    if let Err(lost) = BACKGROUND.set(runtime) {
        lost.shutdown_background();
    }
    BACKGROUND
        .get()
        .map(|runtime| runtime.handle().clone())
        .ok_or_else(|| QueryError::Internal("dispatch runtime unavailable".into()))
}

fn target_label(request: &IndexRequest) -> String {
    match request.target {
        IndexTarget::Index(id) => id.to_string(),
        IndexTarget::AllDocs => "all_docs".to_string(),
    }
}

/// Record the outcome of one scan and wrap it for the caller
fn complete(
    scanned: IndexResult<ScanOutput>,
    request: &IndexRequest,
    tracker: &GenerationTracker,
    metrics: &MetricsRegistry,
) -> QueryResult<QueryEnumerator> {
    match scanned {
        Ok(output) => {
            tracker.set(output.generation);
            metrics.increment_queries_executed();
            log_event_with_fields(
                Event::QueryExecuted,
                &[
                    ("target", &target_label(request)),
                    ("rows", &output.rows.len().to_string()),
                    ("generation", &output.generation.to_string()),
                ],
            );
            Ok(QueryEnumerator::new(output.rows, output.generation))
        }
        Err(err) => {
            let err = QueryError::execution(tracker.get(), err);
            metrics.increment_queries_failed();
            log_event_with_fields(
                Event::QueryFailed,
                &[
                    ("target", &target_label(request)),
                    ("code", err.root().code()),
                    ("error", &err.to_string()),
                ],
            );
            Err(err)
        }
    }
}
