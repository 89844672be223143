//! Result rows produced by index scans

use serde::Serialize;
use serde_json::Value;

use super::key::ViewKey;

/// One row of a query result.
///
/// Map rows carry the emitting document's id; reduced rows do not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    /// Emitted key (document id for the built-in enumeration)
    pub key: ViewKey,
    /// Emitted or reduced value
    pub value: Value,
    /// Source document id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Document body, present when bodies were requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    /// Conflicting revision ids, present in the conflict-reporting enumeration modes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_revisions: Option<Vec<String>>,
}

impl QueryRow {
    /// A map row emitted by `doc_id`
    pub fn mapped(key: ViewKey, value: Value, doc_id: impl Into<String>) -> Self {
        Self {
            key,
            value,
            doc_id: Some(doc_id.into()),
            document: None,
            conflicting_revisions: None,
        }
    }

    /// A reduced (aggregate) row
    pub fn reduced(key: ViewKey, value: Value) -> Self {
        Self {
            key,
            value,
            doc_id: None,
            document: None,
            conflicting_revisions: None,
        }
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.doc_id.as_deref()
    }

    /// Whether this row is an aggregate rather than a single emitted pair
    pub fn is_reduced(&self) -> bool {
        self.doc_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapped_vs_reduced() {
        let row = QueryRow::mapped(ViewKey::from(1i64), json!("v"), "doc1");
        assert_eq!(row.doc_id(), Some("doc1"));
        assert!(!row.is_reduced());

        let agg = QueryRow::reduced(ViewKey::Null, json!(10));
        assert!(agg.is_reduced());
    }

    #[test]
    fn test_serialization_omits_absent_fields() {
        let row = QueryRow::reduced(ViewKey::from("k"), json!(2));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json, json!({"key": "k", "value": 2}));
    }
}
