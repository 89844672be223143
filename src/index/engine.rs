//! Collaborator boundary: the index engine and its change feed
//!
//! The query layer never scans, reduces or stores anything itself; it talks
//! to these two traits only.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::definition::{IndexDescriptor, IndexHandle, MapFunction};
use super::errors::IndexResult;
use super::request::IndexRequest;
use super::row::QueryRow;

/// Rows of a scan plus the generation it was evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutput {
    pub rows: Vec<QueryRow>,
    pub generation: u64,
}

/// Performs scans and manages index existence.
///
/// Implementations are internally synchronized; the query layer only sequences calls.
pub trait IndexEngine: Send + Sync {
    /// Evaluate a request. Blocking.
    fn scan(&self, request: &IndexRequest) -> IndexResult<ScanOutput>;

    /// Create an anonymous index over `map`
    fn create_ephemeral_index(&self, map: MapFunction) -> IndexResult<IndexHandle>;

    /// Delete an index. Fails with `AlreadyDeleted` or `InUse`.
    fn delete_index(&self, index: &IndexDescriptor) -> IndexResult<()>;
}

/// Token identifying one change-feed subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

impl SubscriptionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change that may affect an index's results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Database generation after the change
    pub generation: u64,
    /// Documents touched by the change
    pub doc_ids: Vec<String>,
}

/// Callback invoked on the writer's thread for every change
pub type ChangeCallback = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Change notifications keyed by index identity
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes affecting `index`
    fn subscribe(&self, index: &IndexDescriptor, callback: ChangeCallback) -> IndexResult<SubscriptionToken>;

    /// Remove a subscription. Unknown tokens are ignored.
    ///
    /// A notification already being delivered may still reach the callback.
    fn unsubscribe(&self, token: SubscriptionToken);
}
