//! `qdrant-loader-mcp` entrypoint: JSON-RPC 2.0 over stdio (§4.12, §6).
//!
//! Loads configuration, builds the shared Qdrant/embedding clients once,
//! then serves `stdio()` until shutdown. Configuration is a YAML file
//! (`QDRANT_LOADER_CONFIG`, defaulting to `./config.yaml`) with
//! `QDRANT_URL`, `QDRANT_API_KEY`, `QDRANT_COLLECTION_NAME`, `LLM_API_KEY`
//! layered on top as overrides, per §6's precedence note.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use qdrant_loader::config::Config;
use qdrant_loader::embedding::build_embedding_client;
use qdrant_loader::logging;
use qdrant_loader::mcp::{self, QdrantLoaderMcpServer};
use qdrant_loader::qdrant::QdrantService;
use qdrant_loader::resource_manager::ResourceManager;
use qdrant_loader::search::SearchService;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let config_path = std::env::var("QDRANT_LOADER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let mut config = Config::load(&config_path).with_context(|| format!("loading configuration from {}", config_path.display()))?;
    apply_env_overrides(&mut config);

    let qdrant = Arc::new(QdrantService::new(&config.global.qdrant).context("building Qdrant client")?);
    let embedding: Arc<dyn qdrant_loader::embedding::EmbeddingClient> =
        Arc::from(build_embedding_client(&config.global.llm).context("building embedding client")?);
    let search = Arc::new(SearchService::new(qdrant, embedding, config.global.qdrant.collection_name.clone()));

    let resources = Arc::new(ResourceManager::new(std::time::Duration::from_secs(
        config.global.orchestrator.drain_deadline_s,
    )));
    let shutdown_resources = resources.clone();
    tokio::spawn(async move {
        shutdown_resources.run_until_shutdown().await;
        std::process::exit(0);
    });

    let server = QdrantLoaderMcpServer::new(search, resources.clone());

    mcp::serve_stdio(server, resources).await
}

/// Apply the four documented environment variables as overrides on top of
/// the loaded YAML configuration (§6: "env vars override config-file
/// values").
fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var("QDRANT_URL") {
        config.global.qdrant.url = url;
    }
    if let Ok(api_key) = std::env::var("QDRANT_API_KEY") {
        config.global.qdrant.api_key = Some(api_key);
    }
    if let Ok(collection) = std::env::var("QDRANT_COLLECTION_NAME") {
        config.global.qdrant.collection_name = collection;
    }
    if let Ok(api_key) = std::env::var("LLM_API_KEY") {
        config.global.llm.api_key = Some(api_key);
    }
}
