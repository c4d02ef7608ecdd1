//! Provider-neutral embedding façade (§4.4).
//!
//! The trait shape (`embed`/`count_tokens`/`vector_size`) is the teacher's
//! `EmbeddingClient` trait generalized from a single deterministic
//! implementation to three real network-backed ones routed through
//! [`crate::http_client::RateLimitedHttpClient`]: OpenAI-compatible (covers
//! `openai` and `openai_compat`, which differ only in `base_url`), Azure
//! OpenAI (differs in URL shape and auth header), and Ollama (via the
//! `ollama-rs` crate, grounded on its `GenerateEmbeddingsRequest` usage
//! elsewhere in this pack).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::GenerateEmbeddingsRequest;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::LlmProvider;
use crate::http_client::{HttpClientError, RateLimitedHttpClient, RetryPolicy};

/// Errors raised by an embedding provider (§7: mostly `Transient`/`Auth`).
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The shared HTTP client reported a failure.
    #[error(transparent)]
    Http(#[from] HttpClientError),
    /// The provider returned a different number of vectors than inputs sent.
    #[error("embedding provider returned {returned} vectors for {requested} inputs")]
    CountMismatch {
        /// Number of texts sent.
        requested: usize,
        /// Number of vectors returned.
        returned: usize,
    },
    /// The provider returned no vectors at all.
    #[error("embedding provider returned an empty response")]
    EmptyResponse,
}

impl From<EmbeddingError> for crate::error::ErrorKind {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::Http(http) => http.into(),
            other => crate::error::ErrorKind::Transient(other.to_string()),
        }
    }
}

/// Interface implemented by every embedding backend (§4.4).
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `texts`, splitting into `max_batch`-sized sub-batches
    /// internally and concatenating results in input order.
    async fn embed(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Count tokens using the configured tokenizer, or `ceil(len/4)` when
    /// unavailable (§4.4, §9).
    fn count_tokens(&self, text: &str) -> usize;

    /// Dimensionality of vectors this client produces.
    fn vector_size(&self) -> usize;
}

/// OpenAI-compatible REST embeddings client; also serves `openai_compat`.
pub struct OpenAiCompatClient {
    http: Arc<RateLimitedHttpClient>,
    base_url: String,
    api_key: Option<String>,
    model: String,
    vector_size: usize,
    max_batch: usize,
    token_counter: Arc<dyn Fn(&str) -> usize + Send + Sync>,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        vector_size: usize,
        max_batch: usize,
        policy: RetryPolicy,
    ) -> Result<Self, EmbeddingError> {
        let token_counter = crate::chunk::build_token_counter(&model);
        Ok(Self {
            http: Arc::new(RateLimitedHttpClient::new(policy)?),
            base_url,
            api_key,
            model,
            vector_size,
            max_batch: max_batch.max(1),
            token_counter,
        })
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingsResponse {
    data: Vec<OpenAiEmbeddingItem>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiCompatClient {
    async fn embed(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut results = Vec::with_capacity(texts.len());

        for sub_batch in texts.chunks(self.max_batch) {
            let body = json!({ "model": self.model, "input": sub_batch });
            let api_key = self.api_key.clone();
            let response = self
                .http
                .request_with_retry(Method::POST, &url, cancel, move |req| {
                    let req = req.json(&body);
                    match &api_key {
                        Some(key) => req.bearer_auth(key),
                        None => req,
                    }
                })
                .await?;
            let parsed: OpenAiEmbeddingsResponse = response.json().await.map_err(HttpClientError::Network)?;
            if parsed.data.len() != sub_batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    requested: sub_batch.len(),
                    returned: parsed.data.len(),
                });
            }
            results.extend(parsed.data.into_iter().map(|item| item.embedding));
        }
        Ok(results)
    }

    fn count_tokens(&self, text: &str) -> usize {
        (self.token_counter)(text)
    }

    fn vector_size(&self) -> usize {
        self.vector_size
    }
}

/// Azure OpenAI embeddings client: deployment-scoped URL + `api-key` header.
pub struct AzureOpenAiClient {
    http: Arc<RateLimitedHttpClient>,
    base_url: String,
    api_key: String,
    deployment: String,
    api_version: String,
    vector_size: usize,
    max_batch: usize,
    token_counter: Arc<dyn Fn(&str) -> usize + Send + Sync>,
}

impl AzureOpenAiClient {
    pub fn new(
        base_url: String,
        api_key: String,
        deployment: String,
        vector_size: usize,
        max_batch: usize,
        policy: RetryPolicy,
    ) -> Result<Self, EmbeddingError> {
        let token_counter = crate::chunk::build_token_counter(&deployment);
        Ok(Self {
            http: Arc::new(RateLimitedHttpClient::new(policy)?),
            base_url,
            api_key,
            deployment,
            api_version: "2024-02-01".to_string(),
            vector_size,
            max_batch: max_batch.max(1),
            token_counter,
        })
    }
}

#[async_trait]
impl EmbeddingClient for AzureOpenAiClient {
    async fn embed(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            self.base_url.trim_end_matches('/'),
            self.deployment,
            self.api_version
        );
        let mut results = Vec::with_capacity(texts.len());

        for sub_batch in texts.chunks(self.max_batch) {
            let body = json!({ "input": sub_batch });
            let api_key = self.api_key.clone();
            let response = self
                .http
                .request_with_retry(Method::POST, &url, cancel, move |req| {
                    req.json(&body).header("api-key", api_key.clone())
                })
                .await?;
            let parsed: OpenAiEmbeddingsResponse = response.json().await.map_err(HttpClientError::Network)?;
            if parsed.data.len() != sub_batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    requested: sub_batch.len(),
                    returned: parsed.data.len(),
                });
            }
            results.extend(parsed.data.into_iter().map(|item| item.embedding));
        }
        Ok(results)
    }

    fn count_tokens(&self, text: &str) -> usize {
        (self.token_counter)(text)
    }

    fn vector_size(&self) -> usize {
        self.vector_size
    }
}

/// Local Ollama embeddings client.
pub struct OllamaClient {
    client: Ollama,
    model: String,
    vector_size: usize,
    token_counter: Arc<dyn Fn(&str) -> usize + Send + Sync>,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, model: String, vector_size: usize) -> Self {
        let client = match base_url {
            Some(url) => {
                let parsed = reqwest::Url::parse(&url).ok();
                let host = parsed.as_ref().and_then(|u| u.host_str()).unwrap_or("localhost").to_string();
                let port = parsed.as_ref().and_then(|u| u.port()).unwrap_or(11434);
                Ollama::new(format!("http://{host}"), port)
            }
            None => Ollama::default(),
        };
        let token_counter = crate::chunk::build_token_counter(&model);
        Self {
            client,
            model,
            vector_size,
            token_counter,
        }
    }
}

#[async_trait]
impl EmbeddingClient for OllamaClient {
    async fn embed(
        &self,
        texts: Vec<String>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        // ollama-rs' embeddings request takes one prompt at a time; each
        // text is its own network call (still bounded by the caller's own
        // batching of chunks into an `embed_batch`-sized accumulation, §4.8).
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            let request = GenerateEmbeddingsRequest::new(self.model.clone(), text.into());
            let response = tokio::time::timeout(
                Duration::from_secs(60),
                self.client.generate_embeddings(request),
            )
            .await
            .map_err(|_| {
                EmbeddingError::Http(HttpClientError::Transient {
                    status: reqwest::StatusCode::REQUEST_TIMEOUT,
                    body: "ollama embeddings request timed out".to_string(),
                    attempts: 1,
                })
            })?
            .map_err(|err| {
                EmbeddingError::Http(HttpClientError::Transient {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: err.to_string(),
                    attempts: 1,
                })
            })?;
            let vector = response
                .embeddings
                .into_iter()
                .next()
                .ok_or(EmbeddingError::EmptyResponse)?;
            results.push(vector);
        }
        Ok(results)
    }

    fn count_tokens(&self, text: &str) -> usize {
        (self.token_counter)(text)
    }

    fn vector_size(&self) -> usize {
        self.vector_size
    }
}

/// Build the embedding client configured by `global.llm` (§6).
pub fn build_embedding_client(
    llm: &crate::config::LlmConfig,
) -> Result<Box<dyn EmbeddingClient>, EmbeddingError> {
    let policy = RetryPolicy {
        max_retries: llm.request.max_retries,
        backoff_min: Duration::from_secs_f64(llm.request.backoff_s_min),
        backoff_max: Duration::from_secs_f64(llm.request.backoff_s_max),
        requests_per_minute: llm.rate_limits.rpm,
        timeout: Duration::from_secs(llm.request.timeout_s),
    };
    let max_batch = llm.rate_limits.concurrency.max(1) * 16;

    match llm.provider {
        LlmProvider::Openai | LlmProvider::OpenaiCompat => {
            let base_url = llm
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Box::new(OpenAiCompatClient::new(
                base_url,
                llm.api_key.clone(),
                llm.models.embeddings.clone(),
                llm.embeddings.vector_size,
                max_batch,
                policy,
            )?))
        }
        LlmProvider::AzureOpenai => {
            let base_url = llm.base_url.clone().ok_or_else(|| {
                EmbeddingError::Http(HttpClientError::Build(
                    "azure_openai requires llm.base_url".to_string(),
                ))
            })?;
            let api_key = llm.api_key.clone().ok_or_else(|| {
                EmbeddingError::Http(HttpClientError::Build(
                    "azure_openai requires llm.api_key".to_string(),
                ))
            })?;
            Ok(Box::new(AzureOpenAiClient::new(
                base_url,
                api_key,
                llm.models.embeddings.clone(),
                llm.embeddings.vector_size,
                max_batch,
                policy,
            )?))
        }
        LlmProvider::Ollama => Ok(Box::new(OllamaClient::new(
            llm.base_url.clone(),
            llm.models.embeddings.clone(),
            llm.embeddings.vector_size,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    #[tokio::test]
    async fn openai_compat_embeds_in_input_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        { "embedding": [0.1, 0.2] },
                        { "embedding": [0.3, 0.4] }
                    ]
                }));
            })
            .await;

        let client = OpenAiCompatClient::new(
            server.base_url(),
            None,
            "text-embedding-3-small".into(),
            2,
            16,
            RetryPolicy {
                requests_per_minute: 6000,
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let result = client
            .embed(vec!["a".into(), "b".into()], &cancel)
            .await
            .unwrap();
        mock.assert();
        assert_eq!(result, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn openai_compat_splits_into_max_batch_sized_calls() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/embeddings");
                then.status(200).json_body(json!({
                    "data": [{ "embedding": [0.0] }]
                }));
            })
            .await;

        let client = OpenAiCompatClient::new(
            server.base_url(),
            None,
            "text-embedding-3-small".into(),
            1,
            1,
            RetryPolicy {
                requests_per_minute: 6000,
                ..Default::default()
            },
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let result = client
            .embed(vec!["a".into(), "b".into(), "c".into()], &cancel)
            .await
            .unwrap();
        mock.assert_hits_async(3).await;
        assert_eq!(result.len(), 3);
    }
}
