//! Normalized request handed to an index engine's scan primitive

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::definition::IndexId;
use super::key::ViewKey;

/// When the index is brought up to date relative to the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStalenessPolicy {
    /// Update the index if needed, then scan (default)
    #[default]
    RefreshBefore,
    /// Scan whatever is indexed; results may be out of date
    NeverRefresh,
    /// Scan, then update the index for the next caller
    RefreshAfter,
}

/// Behaviour of the built-in full-document enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllDocsMode {
    /// Every non-deleted document (default)
    #[default]
    All,
    /// Deleted documents too
    IncludeDeleted,
    /// Every non-deleted document, rows carry conflicting revisions
    ShowConflicts,
    /// Only documents that have conflicting revisions
    OnlyConflicts,
}

/// What the scan reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTarget {
    /// A materialized index
    Index(IndexId),
    /// The database's built-in full-document enumeration
    AllDocs,
}

/// Key range with doc-id tie-breakers.
///
/// `start_key` is the bound reached first in iteration order: the lower
/// bound when ascending, the upper bound when descending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    pub start_key: Option<ViewKey>,
    pub end_key: Option<ViewKey>,
    pub start_key_doc_id: Option<String>,
    pub end_key_doc_id: Option<String>,
    pub inclusive_end: bool,
}

impl KeyRange {
    /// An unbounded range with an inclusive end
    pub fn unbounded() -> Self {
        Self {
            inclusive_end: true,
            ..Self::default()
        }
    }

    /// Whether a row at `(key, doc_id)` lies inside the range for the given direction
    pub fn contains(&self, key: &ViewKey, doc_id: &str, descending: bool) -> bool {
        if let Some(start) = &self.start_key {
            let ord = compare_to_bound(key, doc_id, start, self.start_key_doc_id.as_deref());
            let before_start = if descending {
                ord == Ordering::Greater
            } else {
                ord == Ordering::Less
            };
            if before_start {
                return false;
            }
        }

        if let Some(end) = &self.end_key {
            let ord = compare_to_bound(key, doc_id, end, self.end_key_doc_id.as_deref());
            let past_end = if descending {
                ord == Ordering::Less
            } else {
                ord == Ordering::Greater
            };
            if past_end || (!self.inclusive_end && ord == Ordering::Equal) {
                return false;
            }
        }

        true
    }
}

/// Compare a row position to a bound; the doc id only breaks ties when the bound names one.
fn compare_to_bound(key: &ViewKey, doc_id: &str, bound: &ViewKey, bound_doc_id: Option<&str>) -> Ordering {
    key.cmp(bound).then_with(|| match bound_doc_id {
        Some(bound_doc_id) => doc_id.cmp(bound_doc_id),
        None => Ordering::Equal,
    })
}

/// Row selection mode; exact keys and ranges are mutually exclusive by construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    /// Rows for exactly these keys, in list order
    Keys(Vec<ViewKey>),
    /// Range scan
    Range(KeyRange),
}

/// Immutable request, rebuilt from the query spec on every execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub target: IndexTarget,
    pub selection: KeySelection,
    pub skip: usize,
    /// `None` is unbounded; `Some(0)` yields zero rows
    pub limit: Option<usize>,
    pub descending: bool,
    pub reduce: bool,
    /// Always true when built by the translator, so engines never guess
    pub reduce_specified: bool,
    pub group_level: u32,
    pub include_docs: bool,
    /// Ask the engine to report the generation the scan ran against
    pub update_seq: bool,
    pub stale: IndexStalenessPolicy,
    pub all_docs_mode: AllDocsMode,
}

impl IndexRequest {
    /// The range, if this is a range scan
    pub fn range(&self) -> Option<&KeyRange> {
        match &self.selection {
            KeySelection::Range(range) => Some(range),
            KeySelection::Keys(_) => None,
        }
    }

    /// The explicit key list, if this is an exact-key request
    pub fn keys(&self) -> Option<&[ViewKey]> {
        match &self.selection {
            KeySelection::Keys(keys) => Some(keys),
            KeySelection::Range(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: Option<i64>, end: Option<i64>) -> KeyRange {
        KeyRange {
            start_key: start.map(ViewKey::from),
            end_key: end.map(ViewKey::from),
            ..KeyRange::unbounded()
        }
    }

    #[test]
    fn test_ascending_inclusive_range() {
        let r = range(Some(2), Some(4));
        assert!(!r.contains(&ViewKey::from(1i64), "a", false));
        assert!(r.contains(&ViewKey::from(2i64), "a", false));
        assert!(r.contains(&ViewKey::from(4i64), "a", false));
        assert!(!r.contains(&ViewKey::from(5i64), "a", false));
    }

    #[test]
    fn test_exclusive_end() {
        let mut r = range(Some(2), Some(4));
        r.inclusive_end = false;
        assert!(!r.contains(&ViewKey::from(4i64), "a", false));
        assert!(r.contains(&ViewKey::from(3i64), "a", false));
    }

    #[test]
    fn test_descending_start_is_upper_bound() {
        let r = range(Some(4), Some(2));
        assert!(r.contains(&ViewKey::from(4i64), "a", true));
        assert!(r.contains(&ViewKey::from(2i64), "a", true));
        assert!(!r.contains(&ViewKey::from(5i64), "a", true));
        assert!(!r.contains(&ViewKey::from(1i64), "a", true));
    }

    #[test]
    fn test_doc_id_tie_breakers() {
        let r = KeyRange {
            start_key: Some(ViewKey::from(3i64)),
            start_key_doc_id: Some("doc-b".into()),
            end_key: Some(ViewKey::from(3i64)),
            end_key_doc_id: Some("doc-c".into()),
            ..KeyRange::unbounded()
        };
        assert!(!r.contains(&ViewKey::from(3i64), "doc-a", false));
        assert!(r.contains(&ViewKey::from(3i64), "doc-b", false));
        assert!(r.contains(&ViewKey::from(3i64), "doc-c", false));
        assert!(!r.contains(&ViewKey::from(3i64), "doc-d", false));
    }

    #[test]
    fn test_unbounded_contains_everything() {
        let r = KeyRange::unbounded();
        assert!(r.contains(&ViewKey::Null, "x", false));
        assert!(r.contains(&ViewKey::from("zzz"), "x", true));
    }
}
