//! YAML-driven configuration, loaded and validated once at startup (§6).
//!
//! The document has two top-level keys, `global` and `projects`. Every
//! string value may reference an environment variable via `${VAR}`;
//! unresolved references are a configuration error. Once loaded, the result
//! is installed in a global [`OnceLock`] via a `Config`/`init_config`/
//! `get_config` trio.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors encountered while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file's contents are not valid YAML for this schema.
    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A `${VAR}` reference has no matching environment variable.
    #[error("unresolved environment variable reference: ${{{0}}}")]
    UnresolvedVariable(String),
    /// A structural or semantic validation rule was violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::ErrorKind {
    fn from(e: ConfigError) -> Self {
        crate::error::ErrorKind::Config(e.to_string())
    }
}

/// Embedding/chat provider selection (§6 `global.llm.provider`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// OpenAI's hosted API.
    Openai,
    /// Azure OpenAI Service.
    AzureOpenai,
    /// Any OpenAI-compatible endpoint (e.g. a local proxy or alternate vendor).
    OpenaiCompat,
    /// A local Ollama server.
    Ollama,
}

/// `global.qdrant` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    /// Base URL of the Qdrant REST API.
    pub url: String,
    /// Optional API key sent as the `api-key` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Collection every project's vectors are written to.
    pub collection_name: String,
    /// Per-request timeout, in seconds.
    #[serde(default = "default_qdrant_timeout_s")]
    pub timeout_s: u64,
    /// Points per upsert request.
    #[serde(default = "default_qdrant_batch_size")]
    pub batch_size: usize,
}

fn default_qdrant_timeout_s() -> u64 {
    30
}
fn default_qdrant_batch_size() -> usize {
    64
}

/// `global.llm.models` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModels {
    /// Model name used for embedding requests.
    pub embeddings: String,
    /// Model name used for chat/completion requests, if any.
    #[serde(default)]
    pub chat: Option<String>,
}

/// `global.llm.request` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequestConfig {
    /// Per-request timeout, in seconds.
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    /// Maximum retry attempts for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Lower bound of the backoff range, in seconds.
    #[serde(default = "default_backoff_min")]
    pub backoff_s_min: f64,
    /// Upper bound of the backoff range, in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_s_max: f64,
}

fn default_llm_timeout_s() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_min() -> f64 {
    0.5
}
fn default_backoff_max() -> f64 {
    20.0
}

/// `global.llm.rate_limits` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRateLimits {
    /// Requests per minute allowed against the embedding/chat endpoint.
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Maximum concurrent in-flight requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_rpm() -> u32 {
    600
}
fn default_concurrency() -> usize {
    4
}

/// `global.llm.embeddings` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEmbeddingsConfig {
    /// Dimensionality of vectors returned by the embedding model.
    pub vector_size: usize,
}

/// `global.llm` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Which embedding provider to build.
    pub provider: LlmProvider,
    /// Override the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key, if the provider requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model names per role.
    pub models: LlmModels,
    /// Timeout/retry tuning for requests to this provider.
    #[serde(default = "LlmRequestConfig::defaults")]
    pub request: LlmRequestConfig,
    /// Rate limiting for requests to this provider.
    #[serde(default = "LlmRateLimits::defaults")]
    pub rate_limits: LlmRateLimits,
    /// Embedding-specific settings (vector size).
    pub embeddings: LlmEmbeddingsConfig,
}

impl LlmRequestConfig {
    fn defaults() -> Self {
        Self {
            timeout_s: default_llm_timeout_s(),
            max_retries: default_max_retries(),
            backoff_s_min: default_backoff_min(),
            backoff_s_max: default_backoff_max(),
        }
    }
}

impl LlmRateLimits {
    fn defaults() -> Self {
        Self {
            rpm: default_rpm(),
            concurrency: default_concurrency(),
        }
    }
}

/// `global.chunking` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size, in tokens.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Token overlap between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Hard byte ceiling per chunk, independent of token count.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_max_chunk_bytes() -> usize {
    8000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

/// `global.file_conversion` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConversionConfig {
    /// Files larger than this (bytes) are skipped rather than converted.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Per-file conversion timeout, in seconds.
    #[serde(default = "default_conversion_timeout_s")]
    pub conversion_timeout_s: u64,
}

fn default_max_file_size() -> u64 {
    20 * 1024 * 1024
}
fn default_conversion_timeout_s() -> u64 {
    30
}

impl Default for FileConversionConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            conversion_timeout_s: default_conversion_timeout_s(),
        }
    }
}

/// `global.state` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Filesystem path to the SQLite database file.
    pub database_path: String,
}

/// Orchestrator pool sizing, not in `spec.md`'s external-interfaces table but
/// named by §4.8's algorithm; kept under `global` with conservative defaults
/// so existing config documents need not mention it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sources enumerated concurrently per project run.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// Embed+upsert batches allowed in flight concurrently.
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
    /// Chunks accumulated across documents before triggering an embed+upsert batch.
    #[serde(default = "default_embed_batch")]
    pub embed_batch: usize,
    /// How long shutdown waits for in-flight work to drain, in seconds.
    #[serde(default = "default_drain_deadline_s")]
    pub drain_deadline_s: u64,
}

fn default_fetch_concurrency() -> usize {
    8
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_embed_batch() -> usize {
    64
}
fn default_drain_deadline_s() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            embed_concurrency: default_embed_concurrency(),
            embed_batch: default_embed_batch(),
            drain_deadline_s: default_drain_deadline_s(),
        }
    }
}

/// `global` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Qdrant connection settings.
    pub qdrant: QdrantConfig,
    /// Embedding provider settings.
    pub llm: LlmConfig,
    /// Chunking tuning.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// File conversion limits.
    #[serde(default)]
    pub file_conversion: FileConversionConfig,
    /// State store settings.
    pub state: StateConfig,
    /// Ingestion pool sizing.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Adapter-specific configuration, one variant per `source_type` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    /// A git repository.
    Git {
        /// Clone URL.
        url: String,
        /// Branch to check out; defaults to the remote's default branch.
        #[serde(default)]
        branch: Option<String>,
        /// Glob patterns restricting which paths are ingested.
        #[serde(default)]
        include: Vec<String>,
        /// Glob patterns excluded even if matched by `include`.
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// A Confluence space.
    Confluence {
        /// Confluence base URL.
        base_url: String,
        /// Space key to ingest.
        space_key: String,
        /// API token, if not supplied via environment.
        #[serde(default)]
        api_key: Option<String>,
    },
    /// A Jira project.
    Jira {
        /// Jira base URL.
        base_url: String,
        /// Project key to ingest.
        project_key: String,
        /// API token, if not supplied via environment.
        #[serde(default)]
        api_key: Option<String>,
    },
    /// A public documentation site crawled over HTTP.
    Publicdocs {
        /// Site base URL.
        base_url: String,
        /// Path to a sitemap, relative to `base_url`; defaults to `/sitemap.xml`.
        #[serde(default)]
        sitemap_path: Option<String>,
    },
    /// A local directory tree.
    Localfile {
        /// Root directory to walk.
        path: String,
        /// Glob patterns restricting which paths are ingested.
        #[serde(default)]
        include: Vec<String>,
        /// Glob patterns excluded even if matched by `include`.
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl SourceConfig {
    /// The `source_type` this variant belongs to.
    pub fn source_type(&self) -> crate::model::SourceType {
        use crate::model::SourceType;
        match self {
            SourceConfig::Git { .. } => SourceType::Git,
            SourceConfig::Confluence { .. } => SourceType::Confluence,
            SourceConfig::Jira { .. } => SourceType::Jira,
            SourceConfig::Publicdocs { .. } => SourceType::Publicdocs,
            SourceConfig::Localfile { .. } => SourceType::Localfile,
        }
    }
}

/// One entry of `projects` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Human-readable name; defaults to the project id if unset.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Optional free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// `source_type -> source_name -> adapter config`.
    pub sources: BTreeMap<String, BTreeMap<String, SourceConfig>>,
}

/// The full configuration document (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Settings shared by every project.
    pub global: GlobalConfig,
    /// `project_id -> project config`.
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Config {
    /// Load a YAML config document from `path`, substituting `${VAR}`
    /// references before parsing, then validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let resolved = interpolate_env(&raw)?;
        let config: Config = serde_yaml::from_str(&resolved)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural and cross-field validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.projects.is_empty() {
            return Err(ConfigError::Invalid("projects must not be empty".into()));
        }
        for (project_id, project) in &self.projects {
            if project_id.trim().is_empty() {
                return Err(ConfigError::Invalid("project_id must not be empty".into()));
            }
            if project.sources.values().all(|m| m.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "project '{project_id}' defines no sources"
                )));
            }
        }
        if self.global.chunking.chunk_overlap >= self.global.chunking.chunk_size {
            return Err(ConfigError::Invalid(
                "chunking.chunk_overlap must be less than chunking.chunk_size".into(),
            ));
        }
        if self.global.llm.rate_limits.rpm == 0 {
            return Err(ConfigError::Invalid(
                "llm.rate_limits.rpm must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve one configured project into the flattened [`crate::model::Project`]
    /// shape the orchestrator and CLI iterate over: every `(source_name,
    /// SourceConfig)` pair across all `source_type`s, and the single
    /// collection every project shares per §3 ("may be shared across
    /// projects — then `project_id` is a required filter").
    pub fn resolve_project(&self, project_id: &str) -> Option<crate::model::Project> {
        let project = self.projects.get(project_id)?;
        let mut source_configs = Vec::new();
        for by_name in project.sources.values() {
            for (source_name, source_config) in by_name {
                source_configs.push((source_name.clone(), source_config.clone()));
            }
        }
        Some(crate::model::Project {
            project_id: project_id.to_string(),
            display_name: project
                .display_name
                .clone()
                .unwrap_or_else(|| project_id.to_string()),
            collection_name: self.global.qdrant.collection_name.clone(),
            source_configs,
        })
    }

    /// A copy of this configuration with every secret replaced by `"***"`,
    /// for `qdrant-loader config` output (§6).
    pub fn redacted(&self) -> Config {
        let mut clone = self.clone();
        clone.global.qdrant.api_key = clone.global.qdrant.api_key.map(|_| "***".to_string());
        clone.global.llm.api_key = clone.global.llm.api_key.map(|_| "***".to_string());
        for project in clone.projects.values_mut() {
            for by_name in project.sources.values_mut() {
                for source in by_name.values_mut() {
                    redact_source_secret(source);
                }
            }
        }
        clone
    }
}

fn redact_source_secret(source: &mut SourceConfig) {
    match source {
        SourceConfig::Confluence { api_key, .. } | SourceConfig::Jira { api_key, .. } => {
            *api_key = api_key.as_ref().map(|_| "***".to_string());
        }
        _ => {}
    }
}

/// Replace every `${VAR}` occurrence in `text` with the environment
/// variable's value; fail if any reference cannot be resolved.
fn interpolate_env(text: &str) -> Result<String, ConfigError> {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = text[i + 2..].find('}') {
                let name = &text[i + 2..i + 2 + end];
                let value = std::env::var(name)
                    .map_err(|_| ConfigError::UnresolvedVariable(name.to_string()))?;
                out.push_str(&value);
                i += 2 + end + 1;
                continue;
            }
        }
        out.push(text[i..].chars().next().unwrap());
        i += text[i..].chars().next().unwrap().len_utf8();
    }
    Ok(out)
}

/// Global configuration cache populated once at startup.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if it has not been installed.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("config not initialized")
}

/// Load configuration from `path` and install it in the global cache.
pub fn init_config(path: &Path) -> Result<(), ConfigError> {
    let config = Config::load(path)?;
    tracing::debug!(
        qdrant_url = %config.global.qdrant.url,
        collection = %config.global.qdrant.collection_name,
        llm_provider = ?config.global.llm.provider,
        projects = config.projects.len(),
        "loaded configuration"
    );
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::Invalid("config already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_env_substitutes_known_variable() {
        unsafe {
            std::env::set_var("QDRANT_LOADER_TEST_VAR", "secret-value");
        }
        let resolved = interpolate_env("key: ${QDRANT_LOADER_TEST_VAR}").unwrap();
        assert_eq!(resolved, "key: secret-value");
    }

    #[test]
    fn interpolate_env_rejects_unknown_variable() {
        let err = interpolate_env("key: ${QDRANT_LOADER_TEST_VAR_DOES_NOT_EXIST}").unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedVariable(_)));
    }

    #[test]
    fn validate_rejects_empty_projects() {
        let config = Config {
            global: sample_global(),
            projects: BTreeMap::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlap_not_smaller_than_chunk_size() {
        let mut global = sample_global();
        global.chunking.chunk_overlap = global.chunking.chunk_size;
        let mut projects = BTreeMap::new();
        projects.insert(
            "p".to_string(),
            ProjectConfig {
                display_name: None,
                description: None,
                sources: sample_sources(),
            },
        );
        let config = Config { global, projects };
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_masks_api_keys() {
        let mut global = sample_global();
        global.qdrant.api_key = Some("super-secret".to_string());
        let mut projects = BTreeMap::new();
        projects.insert(
            "p".to_string(),
            ProjectConfig {
                display_name: None,
                description: None,
                sources: sample_sources(),
            },
        );
        let config = Config { global, projects };
        let redacted = config.redacted();
        assert_eq!(redacted.global.qdrant.api_key.as_deref(), Some("***"));
    }

    fn sample_global() -> GlobalConfig {
        GlobalConfig {
            qdrant: QdrantConfig {
                url: "http://localhost:6333".into(),
                api_key: None,
                collection_name: "docs".into(),
                timeout_s: default_qdrant_timeout_s(),
                batch_size: default_qdrant_batch_size(),
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                base_url: Some("http://localhost:11434".into()),
                api_key: None,
                models: LlmModels {
                    embeddings: "nomic-embed-text".into(),
                    chat: None,
                },
                request: LlmRequestConfig::defaults(),
                rate_limits: LlmRateLimits::defaults(),
                embeddings: LlmEmbeddingsConfig { vector_size: 768 },
            },
            chunking: ChunkingConfig::default(),
            file_conversion: FileConversionConfig::default(),
            state: StateConfig {
                database_path: "./state.db".into(),
            },
            orchestrator: OrchestratorConfig::default(),
        }
    }

    fn sample_sources() -> BTreeMap<String, BTreeMap<String, SourceConfig>> {
        let mut by_name = BTreeMap::new();
        by_name.insert(
            "A".to_string(),
            SourceConfig::Localfile {
                path: "./docs".into(),
                include: vec![],
                exclude: vec![],
            },
        );
        let mut by_type = BTreeMap::new();
        by_type.insert("localfile".to_string(), by_name);
        by_type
    }
}
