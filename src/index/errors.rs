//! Index engine errors
//!
//! Error codes:
//! - AERO_INDEX_UNAVAILABLE: target index missing or deleted concurrently
//! - AERO_INDEX_SCAN_FAILED: failure during scan or reduce
//! - AERO_INDEX_ALREADY_DELETED: delete of an index that no longer exists
//! - AERO_INDEX_IN_USE: delete of an index that still has users

use thiserror::Error;

use super::definition::IndexId;

/// Result type for index engine operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors reported by an index engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Target index missing or deleted
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    /// Scan or reduce failed
    #[error("Scan failed: {0}")]
    Scan(String),

    /// Index was already deleted
    #[error("Index {0} already deleted")]
    AlreadyDeleted(IndexId),

    /// Index still has users
    #[error("Index {0} is in use")]
    InUse(IndexId),

    /// Engine-internal failure (e.g. poisoned lock)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::Unavailable(_) => "AERO_INDEX_UNAVAILABLE",
            IndexError::Scan(_) => "AERO_INDEX_SCAN_FAILED",
            IndexError::AlreadyDeleted(_) => "AERO_INDEX_ALREADY_DELETED",
            IndexError::InUse(_) => "AERO_INDEX_IN_USE",
            IndexError::Internal(_) => "AERO_INDEX_INTERNAL",
        }
    }

    /// Deletion errors signal a resource-management bug in the caller
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, IndexError::AlreadyDeleted(_) | IndexError::InUse(_))
    }
}
