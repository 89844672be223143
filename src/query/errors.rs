//! # Query Errors
//!
//! Error codes:
//! - AERO_QUERY_VALIDATION: malformed parameter combination
//! - AERO_INDEX_UNAVAILABLE: target index missing or deleted concurrently
//! - AERO_SCAN_FAILED: index engine failure during scan or reduce
//! - AERO_INVALID_CONVERSION: live-query conversion of a spec with no index
//! - AERO_LIFECYCLE_VIOLATION: double delete or delete while in use (fatal)
//! - AERO_QUERY_EXECUTION: lower-layer failure with generation context
//! - AERO_QUERY_CANCELLED: async execution cancelled after it started

use thiserror::Error;

use crate::index::{IndexError, IndexId};

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Misuse of an ephemeral index's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleViolation {
    /// Second deletion of the same index
    #[error("index {0} was already deleted")]
    AlreadyDeleted(IndexId),

    /// Deletion while a scan or subscription still uses the index
    #[error("index {0} is still in use")]
    InUse(IndexId),
}

/// Query layer errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    // ==================
    // Caller Errors
    // ==================
    /// Malformed parameter or parameter combination
    #[error("Validation error: {0}")]
    Validation(String),

    /// Live-query conversion of a spec with no underlying index
    #[error("Invalid conversion: {0}")]
    InvalidConversion(String),

    /// Ephemeral index lifecycle misuse; always fatal
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleViolation),

    // ==================
    // Engine Errors
    // ==================
    /// Target index missing or deleted concurrently
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// Failure during scan or reduce
    #[error("Scan error: {0}")]
    Scan(String),

    /// Lower-layer failure wrapped with the generation known at the time
    #[error("Query execution failed{}: {source}", at_generation(.generation))]
    Execution {
        generation: Option<u64>,
        source: Box<QueryError>,
    },

    // ==================
    // Dispatch Errors
    // ==================
    /// Async execution cancelled after it had started; its rows were discarded
    #[error("Query cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn at_generation(generation: &Option<u64>) -> String {
    match generation {
        Some(g) => format!(" at generation {}", g),
        None => String::new(),
    }
}

impl QueryError {
    /// Wrap an error with generation context. Already-wrapped errors are not nested again.
    pub fn execution(generation: Option<u64>, error: impl Into<QueryError>) -> Self {
        match error.into() {
            wrapped @ QueryError::Execution { .. } => wrapped,
            inner => QueryError::Execution {
                generation,
                source: Box::new(inner),
            },
        }
    }

    /// Returns the error code
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Validation(_) => "AERO_QUERY_VALIDATION",
            QueryError::InvalidConversion(_) => "AERO_INVALID_CONVERSION",
            QueryError::Lifecycle(_) => "AERO_LIFECYCLE_VIOLATION",
            QueryError::IndexUnavailable(_) => "AERO_INDEX_UNAVAILABLE",
            QueryError::Scan(_) => "AERO_SCAN_FAILED",
            QueryError::Execution { .. } => "AERO_QUERY_EXECUTION",
            QueryError::Cancelled => "AERO_QUERY_CANCELLED",
            QueryError::Internal(_) => "AERO_QUERY_INTERNAL",
        }
    }

    /// The innermost error, looking through `Execution` wrappers
    pub fn root(&self) -> &QueryError {
        match self {
            QueryError::Execution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Generation context, if this is an execution wrapper that knows it
    pub fn generation(&self) -> Option<u64> {
        match self {
            QueryError::Execution { generation, .. } => *generation,
            _ => None,
        }
    }

    /// Lifecycle errors signal a resource-management bug and must fail fast
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), QueryError::Lifecycle(_))
    }
}

impl From<IndexError> for QueryError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable(msg) => QueryError::IndexUnavailable(msg),
            IndexError::Scan(msg) => QueryError::Scan(msg),
            IndexError::AlreadyDeleted(id) => LifecycleViolation::AlreadyDeleted(id).into(),
            IndexError::InUse(id) => LifecycleViolation::InUse(id).into(),
            IndexError::Internal(msg) => QueryError::Internal(msg),
        }
    }
}
