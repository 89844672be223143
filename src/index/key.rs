//! View keys with a total, deterministic ordering
//!
//! Ordering: Null < Bool < Number < String < Array < Object.
//! Arrays compare element-wise, a strict prefix sorting first, which is what
//! makes `group_level` prefix grouping line up with index order.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Key emitted into a view index, or used as a bound / explicit key in a query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViewKey {
    /// JSON null
    Null,
    /// Boolean value (false < true)
    Bool(bool),
    /// Number, stored as order-preserving f64 bits
    Number(u64),
    /// String value (code point order)
    String(String),
    /// Compound key
    Array(Vec<ViewKey>),
    /// Object key, members in map order
    Object(Vec<(String, ViewKey)>),
}

impl ViewKey {
    /// Create a key from a number.
    ///
    /// Uses a bit transform so that unsigned comparison matches numeric order.
    pub fn number(v: f64) -> Self {
        // -0.0 and 0.0 must collate as the same key
        let v = if v == 0.0 { 0.0 } else { v };
        let bits = v.to_bits();
        let ordered = if (bits >> 63) == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        };
        ViewKey::Number(ordered)
    }

    /// Create a string key
    pub fn string(v: impl Into<String>) -> Self {
        ViewKey::String(v.into())
    }

    /// Create a compound key
    pub fn array(items: impl IntoIterator<Item = ViewKey>) -> Self {
        ViewKey::Array(items.into_iter().collect())
    }

    /// Decode a number key back to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ViewKey::Number(ordered) => {
                let bits = if (ordered >> 63) == 1 {
                    ordered ^ (1 << 63)
                } else {
                    !ordered
                };
                Some(f64::from_bits(bits))
            }
            _ => None,
        }
    }

    /// Borrow the string payload, if this is a string key
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ViewKey::String(s) => Some(s),
            _ => None,
        }
    }

    /// Create a key from a JSON value. Every JSON value is a valid key.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ViewKey::Null,
            Value::Bool(b) => ViewKey::Bool(*b),
            Value::Number(n) => ViewKey::number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => ViewKey::String(s.clone()),
            Value::Array(items) => ViewKey::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ViewKey::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON. Integral numbers come back as integers.
    pub fn to_json(&self) -> Value {
        match self {
            ViewKey::Null => Value::Null,
            ViewKey::Bool(b) => Value::Bool(*b),
            ViewKey::Number(_) => {
                let v = self.as_f64().unwrap_or(0.0);
                if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    Value::from(v as i64)
                } else {
                    serde_json::Number::from_f64(v)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            ViewKey::String(s) => Value::String(s.clone()),
            ViewKey::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ViewKey::Object(members) => Value::Object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Key prefix used for grouped reduction.
    ///
    /// Arrays are truncated to `level` elements; every other key is its own group.
    pub fn group_prefix(&self, level: u32) -> ViewKey {
        match self {
            ViewKey::Array(items) if (level as usize) < items.len() => {
                ViewKey::Array(items[..level as usize].to_vec())
            }
            other => other.clone(),
        }
    }
}

impl From<&str> for ViewKey {
    fn from(v: &str) -> Self {
        ViewKey::String(v.to_string())
    }
}

impl From<String> for ViewKey {
    fn from(v: String) -> Self {
        ViewKey::String(v)
    }
}

impl From<i64> for ViewKey {
    fn from(v: i64) -> Self {
        ViewKey::number(v as f64)
    }
}

impl From<f64> for ViewKey {
    fn from(v: f64) -> Self {
        ViewKey::number(v)
    }
}

impl From<bool> for ViewKey {
    fn from(v: bool) -> Self {
        ViewKey::Bool(v)
    }
}

impl From<&Value> for ViewKey {
    fn from(v: &Value) -> Self {
        ViewKey::from_json(v)
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for ViewKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ViewKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(ViewKey::from_json(&value))
    }
}
