//! BTreeMap-backed view index
//!
//! Entries are ordered by `(key, doc_id)`, which is exactly the row order of an
//! ascending scan. A document may emit the same key more than once; the values
//! are kept in emission order.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use serde_json::Value;

use super::key::ViewKey;

/// A single materialized view
#[derive(Debug, Default)]
pub struct IndexTree {
    tree: BTreeMap<(ViewKey, String), Vec<Value>>,
    /// doc_id -> keys it emitted, for removal on update
    doc_keys: HashMap<String, Vec<ViewKey>>,
}

impl IndexTree {
    /// Creates a new empty index tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one emitted pair
    pub fn insert(&mut self, key: ViewKey, doc_id: &str, value: Value) {
        self.doc_keys
            .entry(doc_id.to_string())
            .or_default()
            .push(key.clone());
        self.tree
            .entry((key, doc_id.to_string()))
            .or_default()
            .push(value);
    }

    /// Remove everything a document emitted
    pub fn remove_document(&mut self, doc_id: &str) {
        if let Some(keys) = self.doc_keys.remove(doc_id) {
            for key in keys {
                self.tree.remove(&(key, doc_id.to_string()));
            }
        }
    }

    /// All entries in ascending `(key, doc_id)` order
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = (&ViewKey, &str, &Value)> {
        self.tree.iter().flat_map(|((key, doc_id), values)| {
            values.iter().map(move |v| (key, doc_id.as_str(), v))
        })
    }

    /// Entries whose key equals `key`, ascending by doc id
    pub fn entries_for_key<'a>(
        &'a self,
        key: &ViewKey,
    ) -> impl DoubleEndedIterator<Item = (&'a ViewKey, &'a str, &'a Value)> {
        let lower = Bound::Included((key.clone(), String::new()));
        let wanted = key.clone();
        self.tree
            .range((lower, Bound::Unbounded))
            .take_while(move |((k, _), _)| *k == wanted)
            .flat_map(|((k, doc_id), values)| values.iter().map(move |v| (k, doc_id.as_str(), v)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.tree.clear();
        self.doc_keys.clear();
    }

    /// Total number of emitted rows
    pub fn row_count(&self) -> usize {
        self.tree.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_ordered_by_key_then_doc() {
        let mut tree = IndexTree::new();
        tree.insert(ViewKey::from(2i64), "b", json!(1));
        tree.insert(ViewKey::from(1i64), "z", json!(2));
        tree.insert(ViewKey::from(2i64), "a", json!(3));

        let order: Vec<_> = tree.entries().map(|(_, d, _)| d.to_string()).collect();
        assert_eq!(order, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_duplicate_emits_kept() {
        let mut tree = IndexTree::new();
        tree.insert(ViewKey::from("k"), "doc", json!(1));
        tree.insert(ViewKey::from("k"), "doc", json!(2));
        assert_eq!(tree.row_count(), 2);
        let values: Vec<_> = tree.entries_for_key(&ViewKey::from("k")).map(|(_, _, v)| v.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_remove_document() {
        let mut tree = IndexTree::new();
        tree.insert(ViewKey::from("a"), "doc1", json!(null));
        tree.insert(ViewKey::from("b"), "doc1", json!(null));
        tree.insert(ViewKey::from("a"), "doc2", json!(null));
        tree.remove_document("doc1");
        assert_eq!(tree.row_count(), 1);
        assert_eq!(tree.entries().next().map(|(_, d, _)| d), Some("doc2"));
    }

    #[test]
    fn test_entries_for_missing_key() {
        let mut tree = IndexTree::new();
        tree.insert(ViewKey::from(1i64), "doc", json!(null));
        assert_eq!(tree.entries_for_key(&ViewKey::from(2i64)).count(), 0);
    }
}
