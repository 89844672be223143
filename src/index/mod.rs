//! Index engine boundary for aeroview
//!
//! Indexes are derived, in-memory-only state rebuilt from the document set.
//! The query layer depends only on [`IndexEngine`] and [`ChangeFeed`];
//! [`MemoryIndexEngine`] is the in-process implementation of both.
//!
//! # Design Principles
//!
//! - Derived state: indexes mirror documents, never the source of truth
//! - Deterministic: BTreeMap iteration order, `(key, doc_id)` row order
//!
//! # Invariants
//!
//! - Every write advances the database generation by one
//! - Scans report the generation they were evaluated against
//! - Deleting an index that is gone or still subscribed is an error, never a no-op

mod definition;
mod engine;
mod errors;
mod key;
mod memory;
mod request;
mod row;
mod tree;

pub use definition::{
    count_reducer, map_function, reduce_function, sum_reducer, Document, Emitter, IndexDescriptor,
    IndexHandle, IndexId, MapFunction, ReduceFunction,
};
pub use engine::{
    ChangeCallback, ChangeFeed, ChangeNotification, IndexEngine, ScanOutput, SubscriptionToken,
};
pub use errors::{IndexError, IndexResult};
pub use key::ViewKey;
pub use memory::MemoryIndexEngine;
pub use request::{
    AllDocsMode, IndexRequest, IndexStalenessPolicy, IndexTarget, KeyRange, KeySelection,
};
pub use row::QueryRow;
pub use tree::IndexTree;
