//! Document source adapters: one `DocumentSource` implementation per
//! `source_type` (§4.7).
//!
//! The trait shape is a generalization of `context-harness::traits::Connector`
//! (`name`/`description`/`connector_type`/`scan`) from an eagerly-collected
//! `Vec<SourceItem>` to a lazily-iterated, fallible stream of `Document`: the
//! orchestrator's discovery stage consumes each source exactly once and must
//! never buffer an entire upstream (some sources, e.g. a large git repo or a
//! Confluence space, are too big to hold in memory at once).

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::http_client::{HttpClientError, RateLimitedHttpClient, RetryPolicy};
use crate::model::{Document, SourceType};

mod confluence;
mod git;
mod jira;
mod localfile;
mod publicdocs;

/// Errors raised while enumerating or fetching from a source (§7).
#[derive(Debug, Error)]
pub enum SourceError {
    /// The shared HTTP client reported a failure.
    #[error(transparent)]
    Http(#[from] HttpClientError),
    /// A filesystem operation failed.
    #[error("filesystem error at {path}: {source}")]
    Io {
        /// Path the failing operation targeted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// An external helper process (e.g. `git`) exited non-zero.
    #[error("external command '{program}' failed: {message}")]
    Process {
        /// Program that was run.
        program: String,
        /// Failure message, typically stderr.
        message: String,
    },
    /// Bytes-to-text conversion failed.
    #[error(transparent)]
    Conversion(#[from] crate::convert::ConversionError),
    /// The adapter's configuration is invalid.
    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
}

impl From<SourceError> for crate::error::ErrorKind {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Http(http) => http.into(),
            SourceError::Conversion(conv) => conv.into(),
            SourceError::InvalidConfig(msg) => crate::error::ErrorKind::Config(msg),
            SourceError::Io { .. } | SourceError::Process { .. } => {
                crate::error::ErrorKind::Transient(e.to_string())
            }
        }
    }
}

/// Everything a source adapter needs that isn't specific to one instance:
/// shared rate-limited HTTP client and a scratch directory for adapters that
/// need local state (the git adapter's clone cache).
#[derive(Clone)]
pub struct ProjectContext {
    /// Project this enumeration run belongs to.
    pub project_id: String,
    /// Shared rate-limited HTTP client.
    pub http: Arc<RateLimitedHttpClient>,
    /// Scratch directory for adapters needing local state (e.g. git clones).
    pub cache_dir: PathBuf,
    /// Files larger than this (bytes) are skipped rather than converted.
    pub max_file_size: u64,
    /// Per-file conversion timeout.
    pub conversion_timeout: std::time::Duration,
    /// Polled by long-running enumeration to support cooperative cancellation.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// One upstream content source, scoped to a single `(source_type, source_name)`.
///
/// `enumerate` is iterated exactly once per ingestion run; adapters that
/// cannot detect upstream deletions simply never emit a tombstone for a
/// vanished item, leaving that to the orchestrator's orphan sweep (§4.8).
pub trait DocumentSource: Send + Sync {
    /// The `source_type` this adapter instance belongs to.
    fn source_type(&self) -> SourceType;
    /// The configured instance name (e.g. `"docs"`, `"platform"`).
    fn source_name(&self) -> &str;
    /// Lazily enumerate every Document currently visible upstream.
    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>>;
}

/// Construct the adapter instance for one configured source (§4.7, §6).
pub fn build_source(name: &str, config: &SourceConfig) -> Result<Box<dyn DocumentSource>, SourceError> {
    match config {
        SourceConfig::Localfile { path, include, exclude } => Ok(Box::new(
            localfile::LocalfileSource::new(name.to_string(), path.clone(), include.clone(), exclude.clone()),
        )),
        SourceConfig::Git { url, branch, include, exclude } => Ok(Box::new(git::GitSource::new(
            name.to_string(),
            url.clone(),
            branch.clone().unwrap_or_else(|| "main".to_string()),
            include.clone(),
            exclude.clone(),
        ))),
        SourceConfig::Confluence { base_url, space_key, api_key } => Ok(Box::new(
            confluence::ConfluenceSource::new(name.to_string(), base_url.clone(), space_key.clone(), api_key.clone()),
        )),
        SourceConfig::Jira { base_url, project_key, api_key } => Ok(Box::new(jira::JiraSource::new(
            name.to_string(),
            base_url.clone(),
            project_key.clone(),
            api_key.clone(),
        ))),
        SourceConfig::Publicdocs { base_url, sitemap_path } => Ok(Box::new(publicdocs::PublicdocsSource::new(
            name.to_string(),
            base_url.clone(),
            sitemap_path.clone(),
        ))),
    }
}

/// Build the stable `Document` id and fill in the fields every adapter
/// produces the same way, sparing each one the boilerplate.
pub(crate) fn build_document(
    source_type: SourceType,
    source_name: &str,
    url: &str,
    title: String,
    content_type: String,
    content: String,
    metadata: std::collections::BTreeMap<String, serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    is_deleted: bool,
) -> Document {
    let id = crate::identity::document_id(source_type.as_str(), source_name, url);
    Document {
        id,
        title,
        content_type,
        content,
        metadata,
        source_type,
        source_name: source_name.to_string(),
        url: url.to_string(),
        is_deleted,
        created_at,
        updated_at,
    }
}

/// Default retry/backoff policy for source adapters talking to a REST API,
/// shared across confluence/jira/publicdocs (§4.3).
pub(crate) fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::default()
}
