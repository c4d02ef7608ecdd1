//! Shared types used by the Qdrant client and helpers.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned while interacting with Qdrant.
#[derive(Debug, Error)]
pub enum QdrantError {
    /// Base URL failed to parse or normalize.
    #[error("invalid Qdrant URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Qdrant responded with an unexpected status code.
    #[error("unexpected Qdrant response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from Qdrant.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

impl From<QdrantError> for crate::error::ErrorKind {
    fn from(e: QdrantError) -> Self {
        match &e {
            QdrantError::InvalidUrl(_) => crate::error::ErrorKind::Config(e.to_string()),
            QdrantError::Http(_) => crate::error::ErrorKind::Transient(e.to_string()),
            QdrantError::UnexpectedStatus { status, .. } => {
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    crate::error::ErrorKind::Auth(e.to_string())
                } else if status.is_client_error() {
                    crate::error::ErrorKind::InvalidRequest(e.to_string())
                } else {
                    crate::error::ErrorKind::Transient(e.to_string())
                }
            }
        }
    }
}

/// Filters applied to a `search`/`delete_by_document` call (§4.9).
///
/// `project_id` is mandatory: every payload carries it, and every filtered
/// operation scopes to one project even when a collection is shared.
#[derive(Debug, Clone)]
pub struct SearchFilterArgs {
    /// Every filtered operation is scoped to exactly one project.
    pub project_id: String,
    /// Restrict to one `source_type`.
    pub source_type: Option<String>,
    /// Restrict to one configured source instance name.
    pub source_name: Option<String>,
    /// Restrict to one source document.
    pub document_id: Option<String>,
    /// `Some(true)` keeps only attachments, `Some(false)` excludes them.
    pub attachment: Option<bool>,
    /// Restrict to chunks whose document is an attachment of this parent.
    pub parent_document_id: Option<String>,
}

impl SearchFilterArgs {
    /// A bare project-scoped filter with no further constraints.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            source_type: None,
            source_name: None,
            document_id: None,
            attachment: None,
            parent_document_id: None,
        }
    }
}

/// A similarity hit returned by `search`.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    /// The point id assigned at upsert time (UUIDv5, stringified).
    pub id: String,
    /// Cosine similarity score, higher is closer.
    pub score: f32,
    /// The stored payload, if Qdrant was asked to return it.
    pub payload: Option<Map<String, Value>>,
}

/// Summary of how many points an upsert call wrote.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertSummary {
    /// Total points written across all batches.
    pub written: usize,
}

#[derive(Deserialize)]
pub(crate) struct ListCollectionsResponse {
    pub(crate) result: ListCollectionsResult,
}

#[derive(Deserialize)]
pub(crate) struct ListCollectionsResult {
    pub(crate) collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
pub(crate) struct CollectionDescription {
    pub(crate) name: String,
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) id: Value,
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResponse {
    pub(crate) result: ScrollResult,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResult {
    #[serde(default)]
    pub(crate) points: Vec<ScrollPoint>,
    #[serde(default)]
    pub(crate) next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollPoint {
    #[serde(default)]
    pub(crate) id: Option<Value>,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

/// Turn a Qdrant point id (string, number, or `{"uuid": ...}`) into a string.
pub(crate) fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map
            .get("uuid")
            .map(|value| match value {
                Value::String(uuid) => uuid.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
