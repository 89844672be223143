//! Query Layer Configuration
//!
//! Settings for background dispatch and live query refresh.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::{log_event_with_fields, Event};
use crate::query::{QueryError, QueryResult};

/// Top-level configuration for a database handle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeroviewConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub live_query: LiveQueryConfig,
}

/// Background execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Background scans allowed to run at once (default: 4)
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,
}

/// Live query settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveQueryConfig {
    /// Delay between a change notification and the re-run it triggers (default: 200)
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_max_concurrent_scans() -> usize {
    4
}

fn default_update_interval_ms() -> u64 {
    200
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: default_max_concurrent_scans(),
        }
    }
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

impl LiveQueryConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl AeroviewConfig {
    /// Parse and validate a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> QueryResult<Self> {
        let config: AeroviewConfig = serde_json::from_str(json)
            .map_err(|e| QueryError::Validation(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("max_concurrent_scans", &config.dispatch.max_concurrent_scans.to_string()),
                ("update_interval_ms", &config.live_query.update_interval_ms.to_string()),
            ],
        );
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> QueryResult<()> {
        if self.dispatch.max_concurrent_scans == 0 {
            return Err(QueryError::Validation(
                "dispatch.max_concurrent_scans must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Config with no debounce, for callers that want every change applied at once
    pub fn immediate() -> Self {
        Self {
            live_query: LiveQueryConfig {
                update_interval_ms: 0,
            },
            ..Default::default()
        }
    }
}
