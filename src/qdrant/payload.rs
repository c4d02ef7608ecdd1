//! Payload serialization and deterministic point-id construction (§4.9).
//!
//! `point_id` mixes `project_id` into a UUIDv5 namespace input so that
//! replaying ingestion never duplicates points, and so that point ids never
//! collide across projects sharing one collection — resolving the Open
//! Question in spec §9 in favor of project-scoped ids, the same namespacing
//! discipline `codetriever-meta-data::chunk_id::generate_chunk_id` uses for
//! its own deterministic ids.

use uuid::{Uuid, uuid};

use crate::model::{Chunk, VectorPayload};

/// Fixed namespace for point-id derivation. Any value works as long as it
/// never changes: changing it would silently duplicate every existing point.
const POINT_ID_NAMESPACE: Uuid = uuid!("c3c0f2b1-6f7a-4d9b-9e3a-8f2d61b4e6aa");

/// Deterministic point id for `chunk` within `project_id`.
///
/// Replaying ingestion for the same chunk always yields the same id, so a
/// repeated upsert overwrites in place instead of creating a duplicate point.
pub fn point_id(project_id: &str, chunk: &Chunk) -> String {
    let input = format!("{project_id}:{}", chunk.id);
    Uuid::new_v5(&POINT_ID_NAMESPACE, input.as_bytes()).to_string()
}

/// Serialize a payload to the JSON object stored alongside its point.
pub fn build_payload(payload: &VectorPayload) -> serde_json::Value {
    serde_json::to_value(payload).expect("VectorPayload always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;
    use std::collections::BTreeMap;

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc-1".into(),
            chunk_index: 0,
            content: "hello".into(),
            token_count: 1,
            metadata: BTreeMap::new(),
            chunk_total: 1,
            section_path: None,
        }
    }

    #[test]
    fn point_id_is_deterministic() {
        let c = chunk("doc-1#0");
        assert_eq!(point_id("proj-a", &c), point_id("proj-a", &c));
    }

    #[test]
    fn point_id_differs_across_projects() {
        let c = chunk("doc-1#0");
        assert_ne!(point_id("proj-a", &c), point_id("proj-b", &c));
    }

    #[test]
    fn point_id_differs_across_chunks() {
        assert_ne!(
            point_id("proj-a", &chunk("doc-1#0")),
            point_id("proj-a", &chunk("doc-1#1"))
        );
    }

    #[test]
    fn payload_round_trips_required_keys() {
        let payload = VectorPayload {
            project_id: "proj-a".into(),
            source_type: SourceType::Localfile,
            source_name: "docs".into(),
            document_id: "doc-1".into(),
            chunk_index: 0,
            content: "hello".into(),
            url: "file:///tmp/a.md".into(),
            title: "a.md".into(),
            metadata: BTreeMap::new(),
        };
        let value = build_payload(&payload);
        assert_eq!(value["project_id"], "proj-a");
        assert_eq!(value["source_type"], "localfile");
        assert_eq!(value["document_id"], "doc-1");
    }
}
