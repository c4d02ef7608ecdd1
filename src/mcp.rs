//! The MCP server: line-delimited JSON-RPC 2.0 over stdio exposing the
//! search service's three read-only tools (§4.12).
//!
//! `tools/call` wraps each [`crate::search::SearchService`] result as one
//! `text` content block plus the raw value under `structuredContent`,
//! mirroring how a human would read a tool transcript while still giving
//! callers the machine-readable payload. Every dispatch is bounded by
//! [`REQUEST_TIMEOUT`] (§5): exceeding it cancels the in-flight work and
//! returns a JSON-RPC error instead of hanging the request.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult, ServerCapabilities, ServerInfo, Tool, ToolAnnotations};
use rmcp::service::{RequestContext, RoleServer, ServiceExt};
use rmcp::{ErrorData as McpError, handler::server::ServerHandler};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::resource_manager::ResourceManager;
use crate::search::{
    AttachmentHit, AttachmentSearchRequest, HierarchySearchRequest, HierarchySearchResponse, SearchError, SearchHit, SearchRequest, SearchService,
};

/// Per-request timeout applied to every `tools/call` dispatch (§5: "The MCP
/// server applies a per-request timeout (default 60 s); exceeding it
/// returns a JSON-RPC error and cancels the in-flight work.").
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP server implementation exposing the search service's tools.
#[derive(Clone)]
pub struct QdrantLoaderMcpServer {
    search: Arc<SearchService>,
    resources: Arc<ResourceManager>,
}

impl QdrantLoaderMcpServer {
    /// Build a server around a search service and the process's resource
    /// manager, whose cancellation token a `shutdown` JSON-RPC request
    /// (intercepted in [`serve_stdio`], see below) triggers.
    pub fn new(search: Arc<SearchService>, resources: Arc<ResourceManager>) -> Self {
        Self { search, resources }
    }

    fn describe_tools(&self) -> Vec<Tool> {
        vec![
            Tool {
                name: Cow::Borrowed("search"),
                title: Some("Search".to_string()),
                description: Some(Cow::Borrowed(
                    "Semantic search across ingested documents. Required: `query`. Optional: `project_id` (default 'default'), `limit` (default 5), `source_types` (restrict to git/confluence/jira/publicdocs/localfile).",
                )),
                input_schema: Arc::new(search_input_schema()),
                output_schema: None,
                annotations: Some(ToolAnnotations::with_title("Search").read_only(true).idempotent(true).open_world(false)),
                icons: None,
            },
            Tool {
                name: Cow::Borrowed("hierarchy_search"),
                title: Some("Hierarchy Search".to_string()),
                description: Some(Cow::Borrowed(
                    "Semantic search restricted to Confluence pages, aware of page hierarchy. Required: `query`. Optional: `project_id`, `limit` (default 10), `organize_by_hierarchy`, `hierarchy_filter` ({root_only, depth, parent_title, has_children}).",
                )),
                input_schema: Arc::new(hierarchy_search_input_schema()),
                output_schema: None,
                annotations: Some(ToolAnnotations::with_title("Hierarchy Search").read_only(true).idempotent(true).open_world(false)),
                icons: None,
            },
            Tool {
                name: Cow::Borrowed("attachment_search"),
                title: Some("Attachment Search".to_string()),
                description: Some(Cow::Borrowed(
                    "Semantic search over attachments. Required: `query`. Optional: `project_id`, `limit` (default 10), `include_parent_context` (default true), `attachment_filter` ({attachments_only, file_type, file_size_min, file_size_max, author, parent_document_title}).",
                )),
                input_schema: Arc::new(attachment_search_input_schema()),
                output_schema: None,
                annotations: Some(ToolAnnotations::with_title("Attachment Search").read_only(true).idempotent(true).open_world(false)),
                icons: None,
            },
        ]
    }
}

impl ServerHandler for QdrantLoaderMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut implementation = rmcp::model::Implementation::from_build_env();
        implementation.name = "qdrant-loader-mcp".to_string();
        implementation.title = Some("qdrant-loader search".to_string());
        implementation.version = env!("CARGO_PKG_VERSION").to_string();

        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: implementation,
            instructions: Some(
                "qdrant-loader search\n  1) search({ query, project_id?, limit?, source_types? })\n  2) hierarchy_search({ query, project_id?, limit?, organize_by_hierarchy?, hierarchy_filter? })\n  3) attachment_search({ query, project_id?, limit?, include_parent_context?, attachment_filter? })\n  Invalid inputs return invalid_params with a short fix; all responses carry structuredContent.".into(),
            ),
            ..ServerInfo::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools = self.describe_tools();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let search = self.search.clone();
        let resources = self.resources.clone();
        async move {
            // A child of the shutdown token: cancelled either when this request
            // times out (below) or when the process-wide token cancels, but
            // cancelling it never reaches back up to the parent.
            let request_cancel = resources.cancellation_token().child_token();
            let dispatch = dispatch_tool(search, request, request_cancel.clone());
            match tokio::time::timeout(REQUEST_TIMEOUT, dispatch).await {
                Ok(result) => result,
                Err(_) => {
                    request_cancel.cancel();
                    Err(McpError::internal_error(
                        format!("tool call exceeded the {}s request timeout", REQUEST_TIMEOUT.as_secs()),
                        None,
                    ))
                }
            }
        }
    }
}

/// Dispatch one `tools/call` request by name, shared by both the normal path
/// and the timeout wrapper above.
async fn dispatch_tool(search: Arc<SearchService>, request: CallToolRequestParam, cancel: CancellationToken) -> Result<CallToolResult, McpError> {
    match request.name.as_ref() {
        "search" => {
            let args: SearchRequest = parse_arguments(request.arguments)?;
            let hits = search.search(args, &cancel).await.map_err(map_search_error)?;
            Ok(render_result(summarize_search_hits(&hits), json!({ "results": hits })))
        }
        "hierarchy_search" => {
            let args: HierarchySearchRequest = parse_arguments(request.arguments)?;
            let response = search.hierarchy_search(args, &cancel).await.map_err(map_search_error)?;
            Ok(render_result(summarize_hierarchy_response(&response), json!({ "results": response })))
        }
        "attachment_search" => {
            let args: AttachmentSearchRequest = parse_arguments(request.arguments)?;
            let hits = search.attachment_search(args, &cancel).await.map_err(map_search_error)?;
            Ok(render_result(summarize_attachment_hits(&hits), json!({ "results": hits })))
        }
        other => Err(McpError::invalid_params(format!("Unknown tool: {other}"), None)),
    }
}

/// Build a `CallToolResult` carrying both a human-readable `text` summary
/// block and the machine-readable payload under `structuredContent` (§4.12).
fn render_result(summary: String, structured: Value) -> CallToolResult {
    CallToolResult {
        content: Some(vec![Content::text(summary)]),
        structured_content: Some(structured),
        is_error: Some(false),
        ..Default::default()
    }
}

/// One line per hit: title, url, and score, numbered for readability.
fn describe_hit(hit: &SearchHit) -> String {
    format!("{} ({}) — score {:.3}", hit.title, hit.url, hit.score)
}

fn summarize_lines(tool: &str, lines: Vec<String>) -> String {
    if lines.is_empty() {
        return format!("{tool}: no matching documents found.");
    }
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_search_hits(hits: &[SearchHit]) -> String {
    summarize_lines("search", hits.iter().map(describe_hit).collect())
}

fn summarize_hierarchy_response(response: &HierarchySearchResponse) -> String {
    match response {
        HierarchySearchResponse::Flat(hits) => {
            summarize_lines("hierarchy_search", hits.iter().map(|hit| describe_hit(&hit.hit)).collect())
        }
        HierarchySearchResponse::Grouped(groups) => {
            if groups.is_empty() {
                return "hierarchy_search: no matching documents found.".to_string();
            }
            let mut lines = Vec::new();
            for group in groups {
                lines.push(format!("# {}", group.root));
                for hit in &group.hits {
                    lines.push(format!("  - {}", describe_hit(&hit.hit)));
                }
            }
            lines.join("\n")
        }
    }
}

fn summarize_attachment_hits(hits: &[AttachmentHit]) -> String {
    summarize_lines(
        "attachment_search",
        hits.iter()
            .map(|hit| match &hit.parent {
                Some(parent) => format!("{} (attached to: {})", describe_hit(&hit.hit), parent.title),
                None => describe_hit(&hit.hit),
            })
            .collect(),
    )
}

/// Cancel the in-flight request and signal the server process to drain and
/// exit, per §4.12's `shutdown` method.
pub fn request_shutdown(resources: &ResourceManager) {
    resources.trigger_shutdown();
}

/// Serve `server` over stdio, recognizing the §4.12 `shutdown` method ahead
/// of rmcp's dispatcher.
///
/// rmcp only dispatches the standard MCP method set (`initialize`,
/// `tools/list`, `tools/call`, ...) and has no concept of `shutdown`, so an
/// un-intercepted `shutdown` frame would come back as method-not-found. A
/// small task reads stdin line by line ahead of rmcp: a line whose `method`
/// is `shutdown` triggers [`request_shutdown`] and (if it carried an `id`)
/// gets an immediate JSON-RPC result written to stdout; every other line is
/// forwarded byte-for-byte, unparsed, into the transport rmcp actually
/// drives.
pub async fn serve_stdio(server: QdrantLoaderMcpServer, resources: Arc<ResourceManager>) -> anyhow::Result<()> {
    let (forwarder, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(filter_shutdown_requests(resources, forwarder));

    let service = server
        .serve((reader, tokio::io::stdout()))
        .await
        .map_err(|err| anyhow::anyhow!("failed to start MCP server over stdio: {err}"))?;
    service
        .waiting()
        .await
        .map_err(|err| anyhow::anyhow!("MCP server terminated unexpectedly: {err}"))?;
    Ok(())
}

/// Read newline-delimited JSON-RPC frames from the real stdin, intercepting
/// `shutdown` requests and forwarding everything else into `forward_to`
/// (the write half rmcp's transport reads from).
async fn filter_shutdown_requests(resources: Arc<ResourceManager>, mut forward_to: tokio::io::DuplexStream) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "failed reading stdin");
                break;
            }
        };

        let parsed: Option<Value> = serde_json::from_str(&line).ok();
        let is_shutdown = parsed.as_ref().and_then(|v| v.get("method")).and_then(Value::as_str) == Some("shutdown");
        if is_shutdown {
            tracing::info!("received shutdown request, triggering graceful exit");
            request_shutdown(&resources);
            if let Some(id) = parsed.as_ref().and_then(|v| v.get("id")) {
                let response = json!({ "jsonrpc": "2.0", "id": id, "result": null }).to_string();
                let mut stdout = tokio::io::stdout();
                if stdout.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            continue;
        }

        if forward_to.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if forward_to.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: Option<JsonObject>) -> Result<T, McpError> {
    let value = arguments.map(Value::Object).unwrap_or_else(|| Value::Object(JsonObject::new()));
    serde_json::from_value(value).map_err(|err| McpError::invalid_params(format!("Invalid arguments: {err}"), None))
}

fn map_search_error(error: SearchError) -> McpError {
    let message = error.to_string();
    if matches!(error, SearchError::InvalidRequest(_)) {
        return McpError::invalid_params(message, None);
    }
    let kind: ErrorKind = error.into();
    McpError::internal_error(message, Some(json!({ "code": kind.json_rpc_code() })))
}

fn search_input_schema() -> JsonObject {
    let mut properties = JsonObject::new();
    properties.insert("query".into(), string_schema("Natural language query to embed and match"));
    properties.insert("project_id".into(), default_string_schema("Project to scope the search to", "default"));
    properties.insert("limit".into(), integer_schema("Maximum number of results (1-100)", 5));
    properties.insert(
        "source_types".into(),
        array_of_string_schema("Restrict results to these source types", &["git", "confluence", "jira", "publicdocs", "localfile"]),
    );
    finalize_object_schema(properties, &["query"])
}

fn hierarchy_search_input_schema() -> JsonObject {
    let mut filter_properties = JsonObject::new();
    filter_properties.insert("root_only".into(), bool_schema("Keep only pages with no ancestors"));
    filter_properties.insert("depth".into(), integer_schema("Keep only pages at exactly this ancestor depth", 0));
    filter_properties.insert("parent_title".into(), string_schema("Keep only pages whose immediate parent has this title"));
    filter_properties.insert("has_children".into(), bool_schema("Keep only pages that do/don't have child pages"));
    let mut filter_schema = JsonObject::new();
    filter_schema.insert("type".into(), Value::String("object".into()));
    filter_schema.insert("properties".into(), Value::Object(filter_properties));
    filter_schema.insert("additionalProperties".into(), Value::Bool(false));

    let mut properties = JsonObject::new();
    properties.insert("query".into(), string_schema("Natural language query to embed and match"));
    properties.insert("project_id".into(), default_string_schema("Project to scope the search to", "default"));
    properties.insert("limit".into(), integer_schema("Maximum number of results (1-100)", 10));
    properties.insert("organize_by_hierarchy".into(), bool_schema("Group results by root ancestor instead of a flat ranked list"));
    properties.insert("hierarchy_filter".into(), Value::Object(filter_schema));
    finalize_object_schema(properties, &["query"])
}

fn attachment_search_input_schema() -> JsonObject {
    let mut filter_properties = JsonObject::new();
    filter_properties.insert("attachments_only".into(), bool_schema("Restrict candidates to points with a non-null attachment_of"));
    filter_properties.insert("file_type".into(), string_schema("Keep only attachments with this content type or file extension"));
    filter_properties.insert("file_size_min".into(), integer_schema("Minimum file size in bytes", 0));
    filter_properties.insert("file_size_max".into(), integer_schema("Maximum file size in bytes", 0));
    filter_properties.insert("author".into(), string_schema("Keep only attachments authored by this exact name"));
    filter_properties.insert("parent_document_title".into(), string_schema("Keep only attachments whose parent document has this exact title"));
    let mut filter_schema = JsonObject::new();
    filter_schema.insert("type".into(), Value::String("object".into()));
    filter_schema.insert("properties".into(), Value::Object(filter_properties));
    filter_schema.insert("additionalProperties".into(), Value::Bool(false));

    let mut properties = JsonObject::new();
    properties.insert("query".into(), string_schema("Natural language query to embed and match"));
    properties.insert("project_id".into(), default_string_schema("Project to scope the search to", "default"));
    properties.insert("limit".into(), integer_schema("Maximum number of results (1-100)", 10));
    properties.insert("include_parent_context".into(), bool_schema("Batch-fetch each hit's parent title/url (default true)"));
    properties.insert("attachment_filter".into(), Value::Object(filter_schema));
    finalize_object_schema(properties, &["query"])
}

fn string_schema(description: &str) -> Value {
    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("string".into()));
    schema.insert("description".into(), Value::String(description.into()));
    Value::Object(schema)
}

fn default_string_schema(description: &str, default: &str) -> Value {
    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("string".into()));
    schema.insert("description".into(), Value::String(description.into()));
    schema.insert("default".into(), Value::String(default.into()));
    Value::Object(schema)
}

fn bool_schema(description: &str) -> Value {
    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("boolean".into()));
    schema.insert("description".into(), Value::String(description.into()));
    Value::Object(schema)
}

fn integer_schema(description: &str, default: u64) -> Value {
    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("integer".into()));
    schema.insert("description".into(), Value::String(description.into()));
    if default > 0 {
        schema.insert("default".into(), Value::Number(default.into()));
    }
    Value::Object(schema)
}

fn array_of_string_schema(description: &str, allowed: &[&str]) -> Value {
    let mut item_schema = JsonObject::new();
    item_schema.insert("type".into(), Value::String("string".into()));
    item_schema.insert("enum".into(), Value::Array(allowed.iter().map(|v| Value::String((*v).into())).collect()));

    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("array".into()));
    schema.insert("description".into(), Value::String(description.into()));
    schema.insert("items".into(), Value::Object(item_schema));
    Value::Object(schema)
}

fn finalize_object_schema(properties: JsonObject, required: &[&str]) -> JsonObject {
    let mut schema = JsonObject::new();
    schema.insert("type".into(), Value::String("object".into()));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Value::Array(required.iter().map(|&key| Value::String(key.into())).collect()));
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_input_schema_requires_query_and_defaults_project() {
        let schema = search_input_schema();
        assert_eq!(schema["required"], json!(["query"]));
        assert_eq!(schema["properties"]["project_id"]["default"], "default");
    }

    #[test]
    fn hierarchy_search_input_schema_nests_filter_object() {
        let schema = hierarchy_search_input_schema();
        assert_eq!(schema["properties"]["hierarchy_filter"]["type"], "object");
        assert!(schema["properties"]["hierarchy_filter"]["properties"]["has_children"].is_object());
    }

    #[test]
    fn attachment_search_input_schema_nests_filter_object() {
        let schema = attachment_search_input_schema();
        assert_eq!(schema["properties"]["attachment_filter"]["type"], "object");
        assert!(schema["properties"]["attachment_filter"]["properties"]["file_type"].is_object());
    }

    fn sample_hit(document_id: &str, title: &str, url: &str) -> SearchHit {
        SearchHit {
            score: 0.92,
            document_id: document_id.to_string(),
            chunk_index: 0,
            content: "Example chunk content".to_string(),
            source_type: crate::model::SourceType::Localfile,
            source_name: "docs".to_string(),
            url: url.to_string(),
            title: title.to_string(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn summarize_search_hits_mentions_title_and_url() {
        let hits = vec![sample_hit("doc-1", "A doc", "file:///docs/a.md")];
        let summary = summarize_search_hits(&hits);
        assert!(summary.contains("a.md"), "summary should mention the url: {summary}");
        assert!(summary.contains("A doc"));
        assert!(summary.starts_with("1. "));
    }

    #[test]
    fn summarize_search_hits_empty_says_no_results() {
        let summary = summarize_search_hits(&[]);
        assert_eq!(summary, "search: no matching documents found.");
    }

    #[test]
    fn summarize_hierarchy_response_flat_lists_each_hit() {
        let response = HierarchySearchResponse::Flat(vec![crate::search::HierarchyHit {
            hit: sample_hit("doc-1", "Runbook", "https://wiki/runbook"),
            ancestors: vec!["Space".to_string()],
        }]);
        let summary = summarize_hierarchy_response(&response);
        assert!(summary.contains("Runbook"));
    }

    #[test]
    fn summarize_hierarchy_response_grouped_lists_root_headers() {
        let response = HierarchySearchResponse::Grouped(vec![crate::search::HierarchyGroup {
            root: "Engineering".to_string(),
            hits: vec![crate::search::HierarchyHit {
                hit: sample_hit("doc-1", "Runbook", "https://wiki/runbook"),
                ancestors: vec![],
            }],
        }]);
        let summary = summarize_hierarchy_response(&response);
        assert!(summary.contains("# Engineering"));
        assert!(summary.contains("Runbook"));
    }

    #[test]
    fn summarize_attachment_hits_includes_parent_title() {
        let hits = vec![AttachmentHit {
            hit: sample_hit("att-1", "diagram.png", "https://wiki/attachments/diagram.png"),
            parent: Some(crate::search::ParentContext {
                document_id: "doc-1".to_string(),
                title: "Architecture".to_string(),
                url: "https://wiki/architecture".to_string(),
            }),
        }];
        let summary = summarize_attachment_hits(&hits);
        assert!(summary.contains("diagram.png"));
        assert!(summary.contains("Architecture"));
    }

    #[test]
    fn render_result_carries_both_text_and_structured_content() {
        let result = render_result("a summary".to_string(), json!({ "results": [] }));
        assert_eq!(result.is_error, Some(false));
        let content = result.content.expect("content block present");
        assert_eq!(content.len(), 1);
        assert!(result.structured_content.is_some());
    }
}
