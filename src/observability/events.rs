//! Observable events of the query layer
//!
//! Events are explicit and typed; the logger only ever sees `as_str()`.

use std::fmt;

/// Observable events in aeroview
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Execution
    /// Synchronous or background scan returned rows
    QueryExecuted,
    /// Scan failed
    QueryFailed,
    /// Background query submitted to the worker pool
    QuerySubmitted,
    /// Background query cancelled (before or after dispatch)
    QueryCancelled,

    // Live queries
    /// Live query subscribed and issued its initial run
    LiveQueryStarted,
    /// Live query unsubscribed
    LiveQueryStopped,
    /// Live query delivered a new result
    LiveQueryRefreshed,
    /// Live query re-execution failed; previous rows kept
    LiveQueryRefreshFailed,

    // Temporary indexes
    /// Ephemeral index created for an ad-hoc map function
    TempIndexCreated,
    /// Ephemeral index deleted
    TempIndexDeleted,
    /// Undisposed spec dropped; ownership released implicitly
    TempIndexReleasedOnDrop,
    /// Double delete or delete while in flight (FATAL)
    TempIndexLifecycleViolation,

    // Configuration
    /// Configuration loaded
    ConfigLoaded,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::QueryExecuted => "QUERY_EXECUTED",
            Event::QueryFailed => "QUERY_FAILED",
            Event::QuerySubmitted => "QUERY_SUBMITTED",
            Event::QueryCancelled => "QUERY_CANCELLED",
            Event::LiveQueryStarted => "LIVE_QUERY_STARTED",
            Event::LiveQueryStopped => "LIVE_QUERY_STOPPED",
            Event::LiveQueryRefreshed => "LIVE_QUERY_REFRESHED",
            Event::LiveQueryRefreshFailed => "LIVE_QUERY_REFRESH_FAILED",
            Event::TempIndexCreated => "TEMP_INDEX_CREATED",
            Event::TempIndexDeleted => "TEMP_INDEX_DELETED",
            Event::TempIndexReleasedOnDrop => "TEMP_INDEX_RELEASED_ON_DROP",
            Event::TempIndexLifecycleViolation => "TEMP_INDEX_LIFECYCLE_VIOLATION",
            Event::ConfigLoaded => "CONFIG_LOADED",
        }
    }

    /// Returns whether this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::TempIndexLifecycleViolation)
    }

    /// Returns whether this event indicates a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::QueryFailed | Event::LiveQueryRefreshFailed | Event::TempIndexLifecycleViolation
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::QueryExecuted.as_str(), "QUERY_EXECUTED");
        assert_eq!(Event::TempIndexDeleted.as_str(), "TEMP_INDEX_DELETED");
        assert_eq!(Event::LiveQueryRefreshFailed.to_string(), "LIVE_QUERY_REFRESH_FAILED");
    }

    #[test]
    fn test_only_lifecycle_violation_is_fatal() {
        assert!(Event::TempIndexLifecycleViolation.is_fatal());
        assert!(!Event::QueryFailed.is_fatal());
        assert!(Event::QueryFailed.is_failure());
        assert!(!Event::QueryExecuted.is_failure());
    }
}
