//! Filter helpers for Qdrant search and delete queries (§4.9).

use serde_json::{Value, json};

use super::types::SearchFilterArgs;

/// Compose the standard Qdrant filter payload from search/delete arguments.
///
/// `project_id` is always present, so this always returns `Some`; it stays
/// an `Option` for symmetry with the rest of the filter-building helpers.
pub fn build_filter(args: &SearchFilterArgs) -> Option<Value> {
    let mut must: Vec<Value> = vec![json!({
        "key": "project_id",
        "match": { "value": args.project_id }
    })];
    let mut must_not: Vec<Value> = Vec::new();

    if let Some(source_type) = non_empty(args.source_type.as_deref()) {
        must.push(json!({ "key": "source_type", "match": { "value": source_type } }));
    }
    if let Some(source_name) = non_empty(args.source_name.as_deref()) {
        must.push(json!({ "key": "source_name", "match": { "value": source_name } }));
    }
    if let Some(document_id) = non_empty(args.document_id.as_deref()) {
        must.push(json!({ "key": "document_id", "match": { "value": document_id } }));
    }
    if let Some(parent_document_id) = non_empty(args.parent_document_id.as_deref()) {
        must.push(json!({ "key": "attachment_of", "match": { "value": parent_document_id } }));
    }
    match args.attachment {
        Some(true) => must_not.push(json!({ "is_empty": { "key": "attachment_of" } })),
        Some(false) => must.push(json!({ "is_empty": { "key": "attachment_of" } })),
        None => {}
    }

    let mut filter = serde_json::Map::new();
    filter.insert("must".into(), Value::Array(must));
    if !must_not.is_empty() {
        filter.insert("must_not".into(), Value::Array(must_not));
    }
    Some(Value::Object(filter))
}

/// A filter matching every document currently known for one `(project,
/// source_type, source_name)` triple, used by the orchestrator's
/// `delete_by_document` calls during orphan sweep.
pub fn build_document_filter(project_id: &str, document_id: &str) -> Value {
    build_filter(&SearchFilterArgs {
        project_id: project_id.to_string(),
        source_type: None,
        source_name: None,
        document_id: Some(document_id.to_string()),
        attachment: None,
        parent_document_id: None,
    })
    .expect("project_id is always set")
}

fn non_empty(input: Option<&str>) -> Option<&str> {
    input.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filter_always_scopes_by_project() {
        let filter = build_filter(&SearchFilterArgs::for_project("proj-a")).unwrap();
        assert_eq!(
            filter,
            json!({ "must": [{ "key": "project_id", "match": { "value": "proj-a" } }] })
        );
    }

    #[test]
    fn build_filter_adds_source_type_and_name() {
        let filter = build_filter(&SearchFilterArgs {
            source_type: Some("confluence".into()),
            source_name: Some("docs".into()),
            ..SearchFilterArgs::for_project("proj-a")
        })
        .unwrap();
        let must = filter["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
    }

    #[test]
    fn build_filter_attachment_true_excludes_non_attachments() {
        let filter = build_filter(&SearchFilterArgs {
            attachment: Some(true),
            ..SearchFilterArgs::for_project("proj-a")
        })
        .unwrap();
        assert_eq!(
            filter["must_not"],
            json!([{ "is_empty": { "key": "attachment_of" } }])
        );
    }

    #[test]
    fn build_filter_attachment_false_requires_empty_attachment_of() {
        let filter = build_filter(&SearchFilterArgs {
            attachment: Some(false),
            ..SearchFilterArgs::for_project("proj-a")
        })
        .unwrap();
        let must = filter["must"].as_array().unwrap();
        assert!(must.contains(&json!({ "is_empty": { "key": "attachment_of" } })));
    }

    #[test]
    fn build_document_filter_matches_document_id_within_project() {
        let filter = build_document_filter("proj-a", "doc-1");
        let must = filter["must"].as_array().unwrap();
        assert!(must.contains(&json!({ "key": "document_id", "match": { "value": "doc-1" } })));
    }
}
