//! Query spec to index request translation
//!
//! The only place range, key and grouping semantics are encoded. Called on
//! every execution; nothing is cached because specs are mutable between runs.

use crate::index::{IndexRequest, IndexTarget, KeyRange, KeySelection};

use super::spec::QuerySpec;

/// Build the engine request for the spec's current parameters.
///
/// - An explicit key list selects exact-key mode and drops the range bounds
/// - Range bounds are forwarded as given, end inclusive; direction is left
///   to the engine
/// - Reduction is requested exactly when the spec is not map-only, and is
///   always stated explicitly
/// - `group_level` is forwarded even when reduction is off
pub fn translate(spec: &QuerySpec) -> IndexRequest {
    let selection = match spec.keys() {
        Some(keys) => KeySelection::Keys(keys.to_vec()),
        None => KeySelection::Range(KeyRange {
            start_key: spec.start_key().cloned(),
            end_key: spec.end_key().cloned(),
            start_key_doc_id: spec.start_key_doc_id().map(str::to_string),
            end_key_doc_id: spec.end_key_doc_id().map(str::to_string),
            inclusive_end: true,
        }),
    };

    IndexRequest {
        target: spec
            .index()
            .map_or(IndexTarget::AllDocs, |index| IndexTarget::Index(index.id())),
        selection,
        skip: spec.skip(),
        limit: spec.limit(),
        descending: spec.descending(),
        reduce: !spec.map_only(),
        reduce_specified: true,
        group_level: spec.group_level(),
        include_docs: spec.prefetch(),
        update_seq: true,
        stale: spec.stale(),
        all_docs_mode: spec.all_docs_mode(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AeroviewConfig;
    use crate::database::Database;
    use crate::index::{sum_reducer, map_function, AllDocsMode, IndexStalenessPolicy, ViewKey};
    use serde_json::json;

    fn database() -> Database {
        Database::in_memory(AeroviewConfig::default()).unwrap()
    }

    #[test]
    fn test_all_docs_target() {
        let db = database();
        let mut spec = db.create_all_documents_query();
        spec.set_all_docs_mode(AllDocsMode::ShowConflicts);
        let request = translate(&spec);
        assert_eq!(request.target, IndexTarget::AllDocs);
        assert_eq!(request.all_docs_mode, AllDocsMode::ShowConflicts);
        assert!(!request.reduce);
        assert!(request.reduce_specified);
        assert!(request.update_seq);
    }

    #[test]
    fn test_both_bounds_forwarded_inclusive() {
        let db = database();
        let mut spec = db.create_all_documents_query();
        spec.set_start_key(Some(ViewKey::from("a")));
        spec.set_end_key(Some(ViewKey::from("m")));
        spec.set_start_key_doc_id(Some("doc1".into()));
        spec.set_end_key_doc_id(Some("doc9".into()));

        let range = translate(&spec).range().cloned().unwrap();
        assert_eq!(range.start_key, Some(ViewKey::from("a")));
        assert_eq!(range.end_key, Some(ViewKey::from("m")));
        assert_eq!(range.start_key_doc_id.as_deref(), Some("doc1"));
        assert_eq!(range.end_key_doc_id.as_deref(), Some("doc9"));
        assert!(range.inclusive_end);
    }

    #[test]
    fn test_descending_not_swapped() {
        let db = database();
        let mut spec = db.create_all_documents_query();
        spec.set_start_key(Some(ViewKey::from(9i64)));
        spec.set_end_key(Some(ViewKey::from(1i64)));
        spec.set_descending(true);

        let request = translate(&spec);
        assert!(request.descending);
        assert_eq!(request.range().unwrap().start_key, Some(ViewKey::from(9i64)));
    }

    #[test]
    fn test_paging_and_freshness_verbatim() {
        let db = database();
        let mut spec = db.create_all_documents_query();
        spec.set_skip(3);
        spec.set_limit(Some(0));
        spec.set_prefetch(true);
        spec.set_stale(IndexStalenessPolicy::RefreshAfter);

        let request = translate(&spec);
        assert_eq!(request.skip, 3);
        assert_eq!(request.limit, Some(0));
        assert!(request.include_docs);
        assert_eq!(request.stale, IndexStalenessPolicy::RefreshAfter);
    }

    #[test]
    fn test_map_only_wins_over_group_level() {
        let db = database();
        let view = db
            .memory_engine()
            .unwrap()
            .define_view("v", map_function(|d, e| e.emit(d.id.as_str(), json!(1))), Some(sum_reducer()))
            .unwrap();
        let mut spec = db.create_query(view);
        spec.set_group_level(2);
        assert!(translate(&spec).reduce);

        spec.set_map_only(true);
        let request = translate(&spec);
        assert!(!request.reduce);
        assert!(request.reduce_specified);
        assert_eq!(request.group_level, 2);
    }

    #[test]
    fn test_empty_key_list_stays_key_mode() {
        let db = database();
        let mut spec = db.create_all_documents_query();
        spec.set_start_key(Some(ViewKey::from("a")));
        spec.set_keys(Some(Vec::new()));
        let request = translate(&spec);
        assert_eq!(request.keys(), Some(&[][..]));
        assert!(request.range().is_none());
    }
}
