//! Query subsystem for aeroview
//!
//! Turns declarative query parameters into index requests, runs them
//! synchronously or in the background, derives live queries, and manages
//! the lifetime of ephemeral indexes.
//!
//! # Flow
//!
//! ```text
//! QuerySpec --translate--> IndexRequest --dispatcher--> IndexEngine::scan
//!     |                                                       |
//!     +--to_live_query--> LiveQuery <--ChangeFeed-------------+
//! ```
//!
//! # Invariants
//!
//! - Translation is deterministic and recomputed on every run
//! - Async completion is delivered at most once, off the caller's stack
//! - An ephemeral index is deleted exactly once, never while a scan is in flight

mod dispatcher;
mod enumerator;
mod errors;
mod lifecycle;
mod live;
mod options;
mod params;
mod spec;

pub use dispatcher::{CancelHandle, ExecutionDispatcher, PendingQuery};
pub use enumerator::{QueryEnumerator, QueryRow};
pub use errors::{LifecycleViolation, QueryError, QueryResult};
pub use lifecycle::{ScanGuard, TemporaryIndex};
pub use live::{ListenerId, LiveQuery, LiveQueryChange};
pub use options::translate;
pub use params::{ViewQueryParams, EXACT_GROUP_LEVEL};
pub use spec::QuerySpec;
