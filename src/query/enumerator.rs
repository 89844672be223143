//! Immutable query results

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use crate::index::QueryRow;

/// Ordered rows of one execution plus the generation they were read at
#[derive(Debug, Clone, Serialize)]
pub struct QueryEnumerator {
    rows: Vec<QueryRow>,
    generation: u64,
    created_at: DateTime<Utc>,
}

impl QueryEnumerator {
    pub fn new(rows: Vec<QueryRow>, generation: u64) -> Self {
        Self {
            rows,
            generation,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QueryRow> {
        self.rows.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryRow> {
        self.rows.iter()
    }

    pub fn rows(&self) -> &[QueryRow] {
        &self.rows
    }

    /// Generation the scan was evaluated against
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the database has moved past the generation these rows reflect
    pub fn is_stale(&self, current_generation: u64) -> bool {
        current_generation > self.generation
    }

    /// Row-for-row equality, ignoring generation and timestamp
    pub fn same_rows(&self, other: &QueryEnumerator) -> bool {
        self.rows == other.rows
    }
}

impl IntoIterator for QueryEnumerator {
    type Item = QueryRow;
    type IntoIter = std::vec::IntoIter<QueryRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryEnumerator {
    type Item = &'a QueryRow;
    type IntoIter = std::slice::Iter<'a, QueryRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
