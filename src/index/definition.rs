//! Index and document definitions shared between the query layer and engines

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::key::ViewKey;

/// Identity of an index. Change-feed subscriptions are keyed by it.
pub type IndexId = Uuid;

/// Definition of a named or ephemeral index.
///
/// Shared by every query that targets the index; never renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    id: IndexId,
    name: Option<String>,
    has_reduce: bool,
    ephemeral: bool,
}

impl IndexDescriptor {
    /// Descriptor for a named index
    pub fn named(name: impl Into<String>, has_reduce: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Some(name.into()),
            has_reduce,
            ephemeral: false,
        }
    }

    /// Descriptor for an anonymous index created for one ad-hoc query family.
    /// Ephemeral indexes are map-only.
    pub fn ephemeral() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            has_reduce: false,
            ephemeral: true,
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Name, `None` for ephemeral indexes
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the index defines a reduce function
    pub fn has_reduce(&self) -> bool {
        self.has_reduce
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "<ephemeral {}>", self.id),
        }
    }
}

/// Shared reference to an index definition
pub type IndexHandle = Arc<IndexDescriptor>;

/// A stored document as seen by map functions and the built-in enumeration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    /// Document ID
    pub id: String,
    /// Current (winning) revision id
    pub rev: String,
    /// Document body
    pub body: Value,
    /// Tombstone flag
    pub deleted: bool,
    /// Conflicting, non-winning revision ids
    pub conflicts: Vec<String>,
}

impl Document {
    /// Whether the document has unresolved conflicting revisions
    pub fn is_conflicted(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Collects `(key, value)` pairs emitted by a map function
#[derive(Debug, Default)]
pub struct Emitter {
    emitted: Vec<(ViewKey, Value)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit one row for the document being mapped
    pub fn emit(&mut self, key: impl Into<ViewKey>, value: Value) {
        self.emitted.push((key.into(), value));
    }

    /// Consume the emitter, yielding rows in emission order
    pub fn into_rows(self) -> Vec<(ViewKey, Value)> {
        self.emitted
    }
}

/// Transform function run over every live document
pub type MapFunction = Arc<dyn Fn(&Document, &mut Emitter) + Send + Sync>;

/// Aggregation over the keys and values of one group
pub type ReduceFunction = Arc<dyn Fn(&[ViewKey], &[Value]) -> Value + Send + Sync>;

/// Wrap a closure as a [`MapFunction`]
pub fn map_function<F>(f: F) -> MapFunction
where
    F: Fn(&Document, &mut Emitter) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`ReduceFunction`]
pub fn reduce_function<F>(f: F) -> ReduceFunction
where
    F: Fn(&[ViewKey], &[Value]) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Built-in reducer counting rows
pub fn count_reducer() -> ReduceFunction {
    reduce_function(|keys, _values| Value::from(keys.len() as u64))
}

/// Built-in reducer summing numeric values; non-numbers count as zero
pub fn sum_reducer() -> ReduceFunction {
    reduce_function(|_keys, values| {
        let total: f64 = values.iter().filter_map(Value::as_f64).sum();
        if total.fract() == 0.0 {
            Value::from(total as i64)
        } else {
            serde_json::Number::from_f64(total)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_identity() {
        let a = IndexDescriptor::named("by_age", true);
        let b = IndexDescriptor::named("by_age", true);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), Some("by_age"));
        assert!(!a.is_ephemeral());

        let tmp = IndexDescriptor::ephemeral();
        assert!(tmp.is_ephemeral());
        assert!(tmp.name().is_none());
        assert!(!tmp.has_reduce());
    }

    #[test]
    fn test_emitter_keeps_order() {
        let mut emitter = Emitter::new();
        emitter.emit("b", json!(1));
        emitter.emit("a", json!(2));
        let rows = emitter.into_rows();
        assert_eq!(rows[0].0, ViewKey::from("b"));
        assert_eq!(rows[1].1, json!(2));
    }

    #[test]
    fn test_builtin_reducers() {
        let keys = vec![ViewKey::from("a"), ViewKey::from("b"), ViewKey::from("c")];
        let values = vec![json!(1), json!(2), json!("x")];
        assert_eq!(count_reducer()(&keys, &values), json!(3));
        assert_eq!(sum_reducer()(&keys, &values), json!(3));
        assert_eq!(sum_reducer()(&keys[..1], &[json!(0.5)]), json!(0.5));
    }
}
