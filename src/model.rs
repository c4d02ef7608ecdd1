//! Core data model shared by every component (§3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream source kinds recognized by the orchestrator and search service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A git repository (files at a ref, optionally restricted to a subpath).
    Git,
    /// A Confluence space.
    Confluence,
    /// A Jira project's issues.
    Jira,
    /// A public documentation site crawled over HTTP.
    Publicdocs,
    /// A local directory tree.
    Localfile,
}

impl SourceType {
    /// The lower-case string used in ids, payloads, and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Confluence => "confluence",
            SourceType::Jira => "jira",
            SourceType::Publicdocs => "publicdocs",
            SourceType::Localfile => "localfile",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known metadata keys (§3). Freeform keys are also permitted.
pub mod metadata_keys {
    pub const AUTHOR: &str = "author";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
    pub const HIERARCHY_ANCESTORS: &str = "hierarchy_ancestors";
    pub const PARENT_ID: &str = "parent_id";
    pub const ATTACHMENT_OF: &str = "attachment_of";
    pub const FILE_SIZE: &str = "file_size";
    pub const TAGS: &str = "tags";
}

/// The unit of ingestion, transient: never persisted directly (§3, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable id derived from `(source_type, source_name, url)` (§4.1).
    pub id: String,
    /// Human-readable title, used for payload display and search results.
    pub title: String,
    /// MIME type of `content` after conversion.
    pub content_type: String,
    /// Converted, plain-text-or-markup body to be chunked.
    pub content: String,
    /// Freeform metadata; see [`metadata_keys`] for well-known keys.
    pub metadata: BTreeMap<String, Value>,
    /// The adapter kind that produced this Document.
    pub source_type: SourceType,
    /// The configured source instance name that produced this Document.
    pub source_name: String,
    /// Canonical link back to the origin.
    pub url: String,
    /// Set by adapters that can detect deletion inline rather than via orphan sweep.
    pub is_deleted: bool,
    /// Creation timestamp, if the upstream exposes one.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp, if the upstream exposes one.
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Recompute the authoritative content hash from `content`.
    pub fn content_hash(&self) -> String {
        crate::identity::content_hash(&self.content)
    }

    /// A cheap header view, used during discovery before bytes are fetched.
    pub fn header(&self) -> DocumentHeader {
        DocumentHeader {
            id: self.id.clone(),
            title: self.title.clone(),
            source_type: self.source_type,
            source_name: self.source_name.clone(),
            url: self.url.clone(),
            is_deleted: self.is_deleted,
            version_signal: self
                .metadata
                .get(metadata_keys::UPDATED_AT)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }
    }
}

/// `Document` minus `content`: what discovery emits before a fetch (§4.8).
#[derive(Debug, Clone)]
pub struct DocumentHeader {
    /// Stable id derived from `(source_type, source_name, url)` (§4.1).
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// The adapter kind that produced this header.
    pub source_type: SourceType,
    /// The configured source instance name that produced this header.
    pub source_name: String,
    /// Canonical link back to the origin.
    pub url: String,
    /// Set when the adapter can detect deletion without a full fetch.
    pub is_deleted: bool,
    /// Cheap version signal (commit SHA, ETag, mtime) if the adapter has one.
    pub version_signal: Option<String>,
}

/// A contiguous slice of a Document's text emitted by the chunker (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `document.id + "#" + chunk_index`.
    pub id: String,
    /// The Document this chunk was sliced from.
    pub document_id: String,
    /// 0-based position of this chunk within its Document.
    pub chunk_index: usize,
    /// The chunk's text.
    pub content: String,
    /// Token count under the configured tokenizer model.
    pub token_count: usize,
    /// Metadata inherited from the parent Document plus chunk-specific keys.
    pub metadata: BTreeMap<String, Value>,
    /// Total number of chunks produced from the parent Document.
    pub chunk_total: usize,
    /// Heading/section breadcrumb, if the source format exposes structure.
    pub section_path: Option<Vec<String>>,
}

/// A single vector + payload as stored in Qdrant (§3).
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Deterministic UUIDv5 derived from `(project_id, chunk.id)` (§4.8).
    pub point_id: String,
    /// The embedding vector.
    pub vector: Vec<f32>,
    /// Fields stored alongside the vector for filtering and display.
    pub payload: VectorPayload,
}

/// Required + optional payload fields stored alongside every point (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    /// Project this point belongs to; every search is scoped by this field.
    pub project_id: String,
    /// The adapter kind that produced the source document.
    pub source_type: SourceType,
    /// The configured source instance name.
    pub source_name: String,
    /// The source document this chunk came from.
    pub document_id: String,
    /// 0-based position of this chunk within its document.
    pub chunk_index: usize,
    /// The chunk's text, returned verbatim in search results.
    pub content: String,
    /// Canonical link back to the origin document.
    pub url: String,
    /// The document's title.
    pub title: String,
    /// Remaining freeform metadata, flattened into the stored payload.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

/// Per-document durable row used to decide whether to re-process (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Project this record belongs to.
    pub project_id: String,
    /// The adapter kind that produced the document.
    pub source_type: SourceType,
    /// The configured source instance name.
    pub source_name: String,
    /// The document this record tracks.
    pub document_id: String,
    /// Content hash at last successful ingestion, used to detect changes.
    pub content_hash: String,
    /// When this document was last (re-)ingested, successfully or unchanged.
    pub last_ingested_at: DateTime<Utc>,
    /// Parent document id, for attachments (§4.1/§4.11).
    pub parent_id: Option<String>,
    /// Set once the document has been tombstoned (inline delete or orphan sweep).
    pub is_deleted: bool,
}

impl StateRecord {
    /// The composite key used by the state store.
    pub fn key(&self) -> StateKey {
        StateKey {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
            source_name: self.source_name.clone(),
            document_id: self.document_id.clone(),
        }
    }
}

/// Composite primary key for a `StateRecord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StateKey {
    /// Project this key belongs to.
    pub project_id: String,
    /// The adapter kind that produced the document.
    pub source_type: SourceType,
    /// The configured source instance name.
    pub source_name: String,
    /// The document this key identifies.
    pub document_id: String,
}

/// Aggregate counters for one ingestion invocation (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionRun {
    /// Unique id for this invocation, used as the state store's run log key.
    pub run_id: String,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished, successfully or not.
    pub finished_at: Option<DateTime<Utc>>,
    /// Total documents observed across all sources.
    pub documents_seen: u64,
    /// Documents with no prior state record.
    pub documents_new: u64,
    /// Documents whose content hash changed since the last run.
    pub documents_updated: u64,
    /// Documents whose content hash matched the last run.
    pub documents_unchanged: u64,
    /// Documents that failed classification, chunking, embedding, or upsert.
    pub documents_failed: u64,
    /// Total chunks written to Qdrant.
    pub chunks_written: u64,
    /// Total embedding vectors computed.
    pub embeddings_made: u64,
    /// `(source_type, source_name)` pairs whose discovery stream failed.
    pub sources_failed: Vec<(String, String)>,
}

/// Logical grouping of sources that share a collection (§3).
#[derive(Debug, Clone)]
pub struct Project {
    /// Unique identifier used on the CLI and in state/payload records.
    pub project_id: String,
    /// Human-readable name for display.
    pub display_name: String,
    /// The Qdrant collection this project's vectors live in.
    pub collection_name: String,
    /// `(source_name, config)` pairs, flattened from `ProjectConfig::sources`.
    pub source_configs: Vec<(String, crate::config::SourceConfig)>,
}
