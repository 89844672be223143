//! aeroview - view query specification and execution for an embedded document database
//!
//! Query specs, sync/async dispatch with cancellation, live queries and
//! ephemeral index lifetime, over a pluggable index engine.

pub mod config;
pub mod database;
pub mod index;
pub mod observability;
pub mod query;

pub use config::AeroviewConfig;
pub use database::Database;
pub use query::{LiveQuery, QueryEnumerator, QueryError, QueryResult, QuerySpec};
