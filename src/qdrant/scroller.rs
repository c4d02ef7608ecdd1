//! Streaming helpers for iterating Qdrant scroll endpoints without manual loops.

use async_stream::try_stream;
use futures_core::Stream;
use reqwest::Method;
use serde_json::{Map, Value, json};

use super::client::QdrantService;
use super::types::{QdrantError, ScrollResponse, stringify_point_id};

const DEFAULT_SCROLL_LIMIT: usize = 512;

/// Stream `(point_id, payload)` pairs for a collection via the scroll API,
/// used by the search service's `has_children` hierarchy scan and by `ctl
/// project status` for point counts.
pub fn stream_payloads_with_ids<'a>(
    service: &'a QdrantService,
    collection: &'a str,
    with_payload: Value,
    filter: Option<Value>,
) -> impl Stream<Item = Result<(String, Map<String, Value>), QdrantError>> + 'a {
    try_stream! {
        let mut offset: Option<Value> = None;
        let filter_body = filter.unwrap_or_else(|| json!({ "must": [] }));

        loop {
            let mut body = json!({
                "with_payload": with_payload.clone(),
                "with_vector": false,
                "limit": DEFAULT_SCROLL_LIMIT,
                "filter": filter_body.clone(),
            });
            body.as_object_mut()
                .expect("scroll body is object")
                .insert("offset".into(), offset.clone().unwrap_or(Value::Null));

            let response = service
                .request(Method::POST, &format!("collections/{collection}/points/scroll"))?
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(collection, %status, "failed to scroll payloads");
                Err(QdrantError::UnexpectedStatus { status, body })?;
            }

            let ScrollResponse { result } = response.json().await?;
            for point in result.points {
                if let (Some(id), Some(payload)) = (point.id, point.payload) {
                    yield (stringify_point_id(id), payload);
                }
            }

            match result.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{pin_mut, stream::StreamExt};
    use httpmock::{Method::POST, MockServer};
    use reqwest::Client;

    #[tokio::test]
    async fn stream_payloads_with_ids_collects_multiple_pages() {
        let server = MockServer::start_async().await;
        let service = QdrantService {
            client: Client::builder().user_agent("qdrant-loader-test").build().unwrap(),
            base_url: server.base_url(),
            api_key: None,
        };

        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/demo/points/scroll")
                    .body_contains("\"offset\":null");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [{ "id": "a", "payload": { "document_id": "doc-a" } }],
                        "next_page_offset": { "offset": 1 }
                    }
                }));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/demo/points/scroll")
                    .body_contains("\"offset\":{\"offset\":1}");
                then.status(200).json_body(json!({
                    "result": { "points": [{ "id": "b", "payload": { "document_id": "doc-b" } }], "next_page_offset": null }
                }));
            })
            .await;

        let stream = stream_payloads_with_ids(&service, "demo", json!(["document_id"]), None);
        pin_mut!(stream);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.expect("entry"));
        }

        first.assert();
        second.assert();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "a");
        assert_eq!(items[1].0, "b");
    }
}
