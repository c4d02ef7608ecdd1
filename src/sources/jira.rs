//! JIRA source adapter (§4.7).
//!
//! A thin REST pager over the JIRA Cloud search API (`GET /rest/api/2/search`),
//! deliberately shallow per the Non-goals in §1 but implementing the full
//! adapter contract: paginated traversal via `startAt`/`maxResults`, and
//! attachment enumeration (each attachment becomes its own Document with
//! `metadata.attachment_of` pointing at the issue). JIRA's search API has no
//! deletion feed, so a removed issue is only ever detected by the
//! orchestrator's orphan sweep (§4.8).

use async_stream::try_stream;
use futures_util::stream::BoxStream;
use reqwest::Method;
use serde::Deserialize;

use crate::model::{Document, SourceType, metadata_keys};

use super::{DocumentSource, ProjectContext, SourceError, build_document};

const PAGE_SIZE: usize = 50;

pub struct JiraSource {
    name: String,
    base_url: String,
    project_key: String,
    api_key: Option<String>,
}

impl JiraSource {
    pub fn new(name: String, base_url: String, project_key: String, api_key: Option<String>) -> Self {
        Self {
            name,
            base_url,
            project_key,
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

impl DocumentSource for JiraSource {
    fn source_type(&self) -> SourceType {
        SourceType::Jira
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn enumerate<'a>(&'a self, ctx: &'a ProjectContext) -> BoxStream<'a, Result<Document, SourceError>> {
        Box::pin(try_stream! {
            let mut start_at = 0usize;
            loop {
                let url = format!(
                    "{}/rest/api/2/search?jql=project={}&startAt={}&maxResults={}&fields=summary,description,updated,attachment",
                    self.base_url.trim_end_matches('/'),
                    self.project_key,
                    start_at,
                    PAGE_SIZE,
                );
                let response = ctx
                    .http
                    .request_with_retry(Method::GET, &url, &ctx.cancel, |req| self.authed(req))
                    .await?;
                let page: SearchResponse = response.json().await.map_err(crate::http_client::HttpClientError::Network)?;
                let fetched = page.issues.len();

                for issue in page.issues {
                    let issue_key = issue.key.clone();
                    let document = self.issue_to_document(&issue);
                    yield document;
                    for attachment in issue.fields.attachment {
                        yield self.attachment_to_document(&issue_key, attachment);
                    }
                }

                if fetched < PAGE_SIZE {
                    break;
                }
                start_at += PAGE_SIZE;
            }
        })
    }
}

impl JiraSource {
    fn issue_to_document(&self, issue: &Issue) -> Document {
        let url = format!("{}/browse/{}", self.base_url.trim_end_matches('/'), issue.key);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&issue.fields.updated)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        let content = format!(
            "{}\n\n{}",
            issue.fields.summary,
            issue.fields.description.clone().unwrap_or_default()
        );
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(metadata_keys::UPDATED_AT.to_string(), serde_json::Value::String(updated_at.to_rfc3339()));

        build_document(
            SourceType::Jira,
            &self.name,
            &url,
            issue.fields.summary.clone(),
            "text/plain".to_string(),
            content,
            metadata,
            updated_at,
            updated_at,
            false,
        )
    }

    fn attachment_to_document(&self, issue_key: &str, attachment: Attachment) -> Document {
        let updated_at = chrono::DateTime::parse_from_rfc3339(&attachment.created)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(metadata_keys::ATTACHMENT_OF.to_string(), serde_json::Value::String(issue_key.to_string()));
        metadata.insert(metadata_keys::FILE_SIZE.to_string(), serde_json::Value::from(attachment.size));

        build_document(
            SourceType::Jira,
            &self.name,
            &attachment.content,
            attachment.filename,
            attachment.mime_type,
            String::new(),
            metadata,
            updated_at,
            updated_at,
            false,
        )
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    key: String,
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct IssueFields {
    summary: String,
    #[serde(default)]
    description: Option<String>,
    updated: String,
    #[serde(default)]
    attachment: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    filename: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    size: u64,
    created: String,
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{pin_mut, stream::StreamExt};
    use httpmock::MockServer;
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> ProjectContext {
        ProjectContext {
            project_id: "proj".into(),
            http: Arc::new(crate::http_client::RateLimitedHttpClient::new(super::super::default_retry_policy()).unwrap()),
            cache_dir: std::env::temp_dir(),
            max_file_size: 1024 * 1024,
            conversion_timeout: std::time::Duration::from_secs(5),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn emits_issue_and_its_attachment() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/rest/api/2/search");
                then.status(200).json_body(json!({
                    "issues": [{
                        "key": "PROJ-1",
                        "fields": {
                            "summary": "Fix the thing",
                            "description": "details",
                            "updated": "2024-01-01T00:00:00Z",
                            "attachment": [{
                                "filename": "trace.log",
                                "mimeType": "text/plain",
                                "size": 10,
                                "created": "2024-01-01T00:00:00Z",
                                "content": "https://example.atlassian.net/attachments/1"
                            }]
                        }
                    }]
                }));
            })
            .await;

        let source = JiraSource::new("tracker".into(), server.base_url(), "PROJ".into(), None);
        let ctx = context();
        let stream = source.enumerate(&ctx);
        pin_mut!(stream);
        let mut docs = Vec::new();
        while let Some(item) = stream.next().await {
            docs.push(item.unwrap());
        }
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].title, "Fix the thing");
        assert_eq!(docs[1].title, "trace.log");
    }
}
