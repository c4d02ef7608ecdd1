use qdrant_loader::config::QdrantConfig;
use qdrant_loader::embedding::{EmbeddingClient, OllamaClient};
use qdrant_loader::qdrant::QdrantService;
use tokio_util::sync::CancellationToken;

fn live_qdrant_config() -> QdrantConfig {
    QdrantConfig {
        url: std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
        api_key: std::env::var("QDRANT_API_KEY").ok(),
        collection_name: std::env::var("QDRANT_COLLECTION_NAME").unwrap_or_else(|_| "qdrant-loader-docs".to_string()),
        timeout_s: 30,
        batch_size: 64,
    }
}

#[tokio::test]
#[ignore = "Requires a live Qdrant instance"]
async fn live_qdrant_lists_collections() {
    let qdrant = QdrantService::new(&live_qdrant_config()).expect("build Qdrant client");
    let collections = qdrant.list_collections().await.expect("Qdrant should be reachable");
    assert!(
        collections.contains(&live_qdrant_config().collection_name),
        "expected the configured collection to exist: {collections:?}"
    );
}

#[tokio::test]
#[ignore = "Requires a live Ollama server"]
async fn live_ollama_embedding_roundtrip() {
    let base_url = std::env::var("OLLAMA_URL").ok();
    let model = std::env::var("OLLAMA_EMBED_MODEL").unwrap_or_else(|_| "nomic-embed-text".to_string());
    let vector_size: usize = std::env::var("OLLAMA_EMBED_DIMENSION")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(768);

    let client = OllamaClient::new(base_url, model, vector_size);
    let vectors = client
        .embed(vec!["qdrant-loader live embedding".to_string()], &CancellationToken::new())
        .await
        .expect("failed to request embeddings from provider");
    assert_eq!(vectors.len(), 1, "expected one embedding per input text");
    assert_eq!(vectors[0].len(), vector_size, "embedding dimension mismatch");
}
