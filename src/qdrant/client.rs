//! HTTP client wrapper for interacting with Qdrant (§4.9).

use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};

use crate::config::QdrantConfig;
use crate::model::VectorRecord;

use super::filters::build_filter;
use super::payload::build_payload;
use super::types::{
    ListCollectionsResponse, QdrantError, QueryResponse, QueryResponseResult, ScoredPoint,
    SearchFilterArgs, UpsertSummary, stringify_point_id,
};

/// Thin HTTP client for the Qdrant REST API.
pub struct QdrantService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl QdrantService {
    /// Build a client from the resolved `global.qdrant` config section.
    pub fn new(config: &QdrantConfig) -> Result<Self, QdrantError> {
        let client = Client::builder()
            .user_agent("qdrant-loader/0.1")
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()?;
        let base_url = normalize_base_url(&config.url).map_err(QdrantError::InvalidUrl)?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// Ensure `collection_name` exists with the given vector size, creating
    /// or (if `force`) destroying and recreating it (§4.9).
    pub async fn init_collection(
        &self,
        collection_name: &str,
        vector_size: u64,
        force: bool,
    ) -> Result<(), QdrantError> {
        if force && self.collection_exists(collection_name).await? {
            self.delete_collection(collection_name).await?;
        } else if !force && self.collection_exists(collection_name).await? {
            return Ok(());
        }

        let body = json!({ "vectors": { "size": vector_size, "distance": "Cosine" } });
        let response = self
            .request(Method::PUT, &format!("collections/{collection_name}"))?
            .json(&body)
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::debug!(collection = collection_name, vector_size, "collection ensured");
        })
        .await?;
        self.ensure_payload_indexes(collection_name).await
    }

    async fn delete_collection(&self, collection_name: &str) -> Result<(), QdrantError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{collection_name}"))?
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::warn!(collection = collection_name, "collection deleted (force recreate)");
        })
        .await
    }

    /// Upload vectors, splitting into sub-batches of at most `batch_size` (§4.9).
    pub async fn upsert(
        &self,
        collection_name: &str,
        project_id: &str,
        points: &[VectorRecord],
        batch_size: usize,
    ) -> Result<UpsertSummary, QdrantError> {
        if points.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let batch_size = batch_size.max(1);
        let mut written = 0usize;
        for batch in points.chunks(batch_size) {
            let serialized: Vec<Value> = batch
                .iter()
                .map(|record| {
                    json!({
                        "id": record.point_id,
                        "vector": record.vector,
                        "payload": build_payload(&record.payload),
                    })
                })
                .collect();

            let response = self
                .request(
                    Method::PUT,
                    &format!("collections/{collection_name}/points"),
                )?
                .query(&[("wait", true)])
                .json(&json!({ "points": serialized }))
                .send()
                .await?;
            self.ensure_success(response, || {
                tracing::debug!(
                    collection = collection_name,
                    project_id,
                    points = batch.len(),
                    "points upserted"
                );
            })
            .await?;
            written += batch.len();
        }
        Ok(UpsertSummary { written })
    }

    /// Similarity search, clamping `limit` to `[1, 100]` per §4.9.
    pub async fn search(
        &self,
        collection_name: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &SearchFilterArgs,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, QdrantError> {
        let limit = limit.clamp(1, 100);
        let mut body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });
        let obj = body.as_object_mut().expect("query body is an object");
        if let Some(filter_value) = build_filter(filter) {
            obj.insert("filter".into(), filter_value);
        }
        if let Some(threshold) = score_threshold {
            obj.insert("score_threshold".into(), Value::from(threshold));
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection_name}/points/query"),
            )?
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(collection = collection_name, error = %error, "search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        Ok(points
            .into_iter()
            .map(|point| ScoredPoint {
                id: stringify_point_id(point.id),
                score: point.score,
                payload: point.payload,
            })
            .collect())
    }

    /// Filtered delete of every point belonging to `document_id` (§4.9).
    pub async fn delete_by_document(
        &self,
        collection_name: &str,
        project_id: &str,
        document_id: &str,
    ) -> Result<(), QdrantError> {
        let filter = super::filters::build_document_filter(project_id, document_id);
        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection_name}/points/delete"),
            )?
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::debug!(collection = collection_name, project_id, document_id, "points deleted");
        })
        .await
    }

    /// Enumerate all collection names currently known to Qdrant.
    pub async fn list_collections(&self) -> Result<Vec<String>, QdrantError> {
        let response = self.request(Method::GET, "collections")?.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QdrantError::UnexpectedStatus { status, body });
        }
        let payload: ListCollectionsResponse = response.json().await?;
        Ok(payload
            .result
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn collection_exists(&self, collection_name: &str) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection_name}"))?
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(QdrantError::UnexpectedStatus { status, body })
            }
        }
    }

    /// Ensure payload indexes exist for every field used in filters (§4.9).
    async fn ensure_payload_indexes(&self, collection_name: &str) -> Result<(), QdrantError> {
        let fields: [(&str, &str); 5] = [
            ("project_id", "keyword"),
            ("source_type", "keyword"),
            ("source_name", "keyword"),
            ("document_id", "keyword"),
            ("attachment_of", "keyword"),
        ];
        for (field, schema) in fields {
            let response = self
                .request(Method::PUT, &format!("collections/{collection_name}/index"))?
                .json(&json!({ "field_name": field, "field_schema": schema }))
                .send()
                .await?;
            match response.status() {
                status if status.is_success() => {
                    tracing::debug!(collection = collection_name, field, "payload index ensured");
                }
                StatusCode::CONFLICT => {
                    tracing::debug!(collection = collection_name, field, "payload index already exists");
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(collection = collection_name, field, %status, body, "failed to ensure payload index");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, QdrantError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }

    async fn ensure_success<F: FnOnce()>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), QdrantError> {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

pub(crate) fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceType, VectorPayload};
    use httpmock::{Method::POST, MockServer};
    use std::collections::BTreeMap;

    fn service(base_url: String) -> QdrantService {
        QdrantService {
            client: Client::builder()
                .user_agent("qdrant-loader-test")
                .build()
                .expect("client"),
            base_url,
            api_key: None,
        }
    }

    #[tokio::test]
    async fn search_emits_project_scoped_filter_and_parses_hits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/demo/points/query")
                    .body_contains("\"project_id\"");
                then.status(200).json_body(json!({
                    "result": [
                        { "id": "11111111-1111-1111-1111-111111111111", "score": 0.9, "payload": { "document_id": "doc-1" } }
                    ]
                }));
            })
            .await;

        let svc = service(server.base_url());
        let hits = svc
            .search(
                "demo",
                vec![0.1, 0.2],
                5,
                &SearchFilterArgs::for_project("proj-a"),
                None,
            )
            .await
            .expect("search");

        mock.assert();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "11111111-1111-1111-1111-111111111111");
    }

    #[tokio::test]
    async fn upsert_splits_into_batches() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(reqwest::Method::PUT)
                    .path("/collections/demo/points");
                then.status(200).json_body(json!({ "result": { "status": "acknowledged" } }));
            })
            .await;

        let svc = service(server.base_url());
        let points: Vec<VectorRecord> = (0..5)
            .map(|i| VectorRecord {
                point_id: format!("id-{i}"),
                vector: vec![0.0; 3],
                payload: VectorPayload {
                    project_id: "proj-a".into(),
                    source_type: SourceType::Localfile,
                    source_name: "docs".into(),
                    document_id: format!("doc-{i}"),
                    chunk_index: 0,
                    content: "x".into(),
                    url: "file:///x".into(),
                    title: "x".into(),
                    metadata: BTreeMap::new(),
                },
            })
            .collect();

        let summary = svc
            .upsert("demo", "proj-a", &points, 2)
            .await
            .expect("upsert");

        assert_eq!(summary.written, 5);
        mock.assert_hits_async(3).await;
    }
}
