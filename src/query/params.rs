//! # View Query Parameter Parser
//!
//! Parses string-keyed view query parameters (`skip`, `limit`, `startkey`, ...)
//! into typed settings that can be applied to a [`QuerySpec`].
//!
//! Keys are JSON values: `startkey=["a",1]`, `keys=["x","y"]`.

use std::collections::HashMap;

use serde_json::Value;

use crate::index::{IndexStalenessPolicy, ViewKey};

use super::errors::{QueryError, QueryResult};
use super::spec::QuerySpec;

/// Group level used for `group=true`: deep enough to group by the exact key
pub const EXACT_GROUP_LEVEL: u32 = u32::MAX;

/// Parsed view query parameters; `None` means "not supplied"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQueryParams {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub descending: Option<bool>,
    pub start_key: Option<ViewKey>,
    pub end_key: Option<ViewKey>,
    pub start_key_doc_id: Option<String>,
    pub end_key_doc_id: Option<String>,
    pub keys: Option<Vec<ViewKey>>,
    pub group_level: Option<u32>,
    pub reduce: Option<bool>,
    pub include_docs: Option<bool>,
    pub stale: Option<IndexStalenessPolicy>,
}

impl ViewQueryParams {
    /// Parse parameters from a HashMap. Unknown keys are ignored.
    pub fn parse(params: &HashMap<String, String>) -> QueryResult<Self> {
        let mut result = ViewQueryParams::default();
        let mut group = None;

        for (key, value) in params {
            match key.as_str() {
                "skip" => result.skip = Some(parse_skip(value)?),
                "limit" => result.limit = Some(parse_count(key, value)?),
                "descending" => result.descending = Some(parse_bool(key, value)?),
                "startkey" | "start_key" => result.start_key = Some(parse_key(key, value)?),
                "endkey" | "end_key" => result.end_key = Some(parse_key(key, value)?),
                "startkey_docid" | "start_key_doc_id" => result.start_key_doc_id = Some(value.clone()),
                "endkey_docid" | "end_key_doc_id" => result.end_key_doc_id = Some(value.clone()),
                "keys" => result.keys = Some(parse_keys(value)?),
                "group_level" => {
                    let level = parse_count(key, value)?;
                    let level = u32::try_from(level).map_err(|_| {
                        QueryError::Validation(format!("group_level out of range: {}", value))
                    })?;
                    result.group_level = Some(level);
                }
                "group" => group = Some(parse_bool(key, value)?),
                "reduce" => result.reduce = Some(parse_bool(key, value)?),
                "include_docs" => result.include_docs = Some(parse_bool(key, value)?),
                "stale" => result.stale = Some(parse_stale(value)?),
                _ => {}
            }
        }

        // An explicit group_level wins over group
        if result.group_level.is_none() {
            result.group_level = group.map(|g| if g { EXACT_GROUP_LEVEL } else { 0 });
        }

        Ok(result)
    }

    /// Write every supplied parameter into `spec`
    pub fn apply_to(&self, spec: &mut QuerySpec) {
        if let Some(skip) = self.skip {
            spec.set_skip(skip);
        }
        if let Some(limit) = self.limit {
            spec.set_limit(Some(limit));
        }
        if let Some(descending) = self.descending {
            spec.set_descending(descending);
        }
        if let Some(key) = &self.start_key {
            spec.set_start_key(Some(key.clone()));
        }
        if let Some(key) = &self.end_key {
            spec.set_end_key(Some(key.clone()));
        }
        if let Some(doc_id) = &self.start_key_doc_id {
            spec.set_start_key_doc_id(Some(doc_id.clone()));
        }
        if let Some(doc_id) = &self.end_key_doc_id {
            spec.set_end_key_doc_id(Some(doc_id.clone()));
        }
        if let Some(keys) = &self.keys {
            spec.set_keys(Some(keys.clone()));
        }
        if let Some(level) = self.group_level {
            spec.set_group_level(level);
        }
        if let Some(reduce) = self.reduce {
            spec.set_map_only(!reduce);
        }
        if let Some(include_docs) = self.include_docs {
            spec.set_prefetch(include_docs);
        }
        if let Some(stale) = self.stale {
            spec.set_stale(stale);
        }
    }
}

/// Negative skips clamp to zero
fn parse_skip(value: &str) -> QueryResult<usize> {
    let skip: i64 = value
        .trim()
        .parse()
        .map_err(|_| QueryError::Validation(format!("Invalid skip value: {}", value)))?;
    Ok(usize::try_from(skip.max(0)).unwrap_or(usize::MAX))
}

fn parse_count(name: &str, value: &str) -> QueryResult<usize> {
    let n: i64 = value
        .trim()
        .parse()
        .map_err(|_| QueryError::Validation(format!("Invalid {} value: {}", name, value)))?;
    usize::try_from(n).map_err(|_| QueryError::Validation(format!("{} must not be negative: {}", name, value)))
}

fn parse_bool(name: &str, value: &str) -> QueryResult<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(QueryError::Validation(format!(
            "Invalid {} value: {} (expected true or false)",
            name, other
        ))),
    }
}

fn parse_key(name: &str, value: &str) -> QueryResult<ViewKey> {
    let json: Value = serde_json::from_str(value)
        .map_err(|e| QueryError::Validation(format!("Invalid {} JSON: {}", name, e)))?;
    Ok(ViewKey::from_json(&json))
}

fn parse_keys(value: &str) -> QueryResult<Vec<ViewKey>> {
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Array(items)) => Ok(items.iter().map(ViewKey::from_json).collect()),
        Ok(_) => Err(QueryError::Validation("keys must be a JSON array".into())),
        Err(e) => Err(QueryError::Validation(format!("Invalid keys JSON: {}", e))),
    }
}

fn parse_stale(value: &str) -> QueryResult<IndexStalenessPolicy> {
    match value.trim() {
        "ok" => Ok(IndexStalenessPolicy::NeverRefresh),
        "update_after" => Ok(IndexStalenessPolicy::RefreshAfter),
        "false" => Ok(IndexStalenessPolicy::RefreshBefore),
        other => Err(QueryError::Validation(format!("Invalid stale value: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AeroviewConfig;
    use crate::database::Database;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_paging_and_direction() {
        let parsed = ViewQueryParams::parse(&params(&[
            ("skip", "2"),
            ("limit", "3"),
            ("descending", "true"),
        ]))
        .unwrap();
        assert_eq!(parsed.skip, Some(2));
        assert_eq!(parsed.limit, Some(3));
        assert_eq!(parsed.descending, Some(true));
    }

    #[test]
    fn test_negative_skip_clamps() {
        let parsed = ViewQueryParams::parse(&params(&[("skip", "-5")])).unwrap();
        assert_eq!(parsed.skip, Some(0));
    }

    #[test]
    fn test_negative_limit_rejected() {
        let err = ViewQueryParams::parse(&params(&[("limit", "-1")])).unwrap_err();
        assert_eq!(err.code(), "AERO_QUERY_VALIDATION");
    }

    #[test]
    fn test_json_keys() {
        let parsed = ViewQueryParams::parse(&params(&[
            ("startkey", r#"["a", 1]"#),
            ("endkey", r#""z""#),
            ("keys", r#"["x", 2]"#),
        ]))
        .unwrap();
        assert_eq!(
            parsed.start_key,
            Some(ViewKey::array(vec![ViewKey::from("a"), ViewKey::from(1i64)]))
        );
        assert_eq!(parsed.end_key, Some(ViewKey::from("z")));
        assert_eq!(parsed.keys.map(|k| k.len()), Some(2));
    }

    #[test]
    fn test_bad_json_and_bool_rejected() {
        assert!(ViewQueryParams::parse(&params(&[("startkey", "{nope")])).is_err());
        assert!(ViewQueryParams::parse(&params(&[("keys", r#""x""#)])).is_err());
        assert!(ViewQueryParams::parse(&params(&[("descending", "yes")])).is_err());
        assert!(ViewQueryParams::parse(&params(&[("stale", "later")])).is_err());
    }

    #[test]
    fn test_group_and_stale() {
        let parsed = ViewQueryParams::parse(&params(&[("group", "true"), ("stale", "update_after")])).unwrap();
        assert_eq!(parsed.group_level, Some(EXACT_GROUP_LEVEL));
        assert_eq!(parsed.stale, Some(IndexStalenessPolicy::RefreshAfter));
    }

    #[test]
    fn test_apply_only_supplied() {
        let db = Database::in_memory(AeroviewConfig::default()).unwrap();
        let mut spec = db.create_all_documents_query();
        spec.set_descending(true);
        spec.set_limit(Some(9));

        let parsed = ViewQueryParams::parse(&params(&[("skip", "4"), ("include_docs", "true")])).unwrap();
        parsed.apply_to(&mut spec);

        assert_eq!(spec.skip(), 4);
        assert!(spec.prefetch());
        assert!(spec.descending());
        assert_eq!(spec.limit(), Some(9));
    }
}
