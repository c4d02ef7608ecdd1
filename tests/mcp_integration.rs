use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use httpmock::{Method::POST, MockServer};
use rmcp::{
    handler::client::ClientHandler,
    model::{self, CallToolRequestParam, ClientInfo, PaginatedRequestParam},
    service::{RoleClient, RoleServer, RunningService, Service, serve_directly},
    transport::async_rw::AsyncRwTransport,
};
use qdrant_loader::config::Config;
use qdrant_loader::embedding::build_embedding_client;
use qdrant_loader::mcp::QdrantLoaderMcpServer;
use qdrant_loader::qdrant::QdrantService;
use qdrant_loader::resource_manager::ResourceManager;
use qdrant_loader::search::SearchService;
use serde_json::json;
use tokio::io::split;

#[derive(Clone, Default)]
struct DummyClientHandler;

impl ClientHandler for DummyClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo::default()
    }
}

struct TestHarness {
    service: RunningService<RoleClient, DummyClientHandler>,
    server: RunningService<RoleServer, QdrantLoaderMcpServer>,
}

fn config_yaml(qdrant_url: &str, llm_url: &str) -> String {
    format!(
        r#"
global:
  qdrant:
    url: "{qdrant_url}"
    collection_name: "docs"
  llm:
    provider: openai_compat
    base_url: "{llm_url}"
    models:
      embeddings: "fake-embed"
    embeddings:
      vector_size: 3
  state:
    database_path: "state.db"
projects:
  default:
    sources:
      localfile:
        docs:
          type: localfile
          path: "."
"#
    )
}

impl TestHarness {
    async fn new(qdrant_base_url: &str, llm_base_url: &str) -> Self {
        let yaml = config_yaml(qdrant_base_url, llm_base_url);
        let dir = tempfile::tempdir().expect("tempdir");
        let path: PathBuf = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).expect("write config");
        let config = Config::load(&path).expect("load config");

        let qdrant = Arc::new(QdrantService::new(&config.global.qdrant).expect("qdrant client"));
        let embedding: Arc<dyn qdrant_loader::embedding::EmbeddingClient> =
            Arc::from(build_embedding_client(&config.global.llm).expect("embedding client"));
        let search = Arc::new(SearchService::new(qdrant, embedding, config.global.qdrant.collection_name.clone()));
        let resources = Arc::new(ResourceManager::new(Duration::from_secs(5)));
        let server = QdrantLoaderMcpServer::new(search, resources);

        let (client_stream, server_stream) = tokio::io::duplex(16 * 1024);
        let (client_read, client_write) = split(client_stream);
        let (server_read, server_write) = split(server_stream);

        let client_transport = AsyncRwTransport::new_client(client_read, client_write);
        let server_transport = AsyncRwTransport::new_server(server_read, server_write);

        let server_info = server.get_info();
        let client_handler = DummyClientHandler;
        let client_info = ClientHandler::get_info(&client_handler);

        let server = serve_directly::<RoleServer, _, _, _, _>(server, server_transport, Some(client_info));
        let service = serve_directly::<RoleClient, _, _, _, _>(client_handler, client_transport, Some(server_info));

        Self { service, server }
    }

    async fn shutdown(self) {
        let Self { service, server } = self;
        let _ = service.cancel().await;
        let _ = server.cancel().await;
    }
}

#[tokio::test]
async fn initialize_and_list_tools() {
    let qdrant_server = MockServer::start_async().await;
    let llm_server = MockServer::start_async().await;
    let harness = TestHarness::new(&qdrant_server.base_url(), &llm_server.base_url()).await;
    let service = &harness.service;

    let info = service.peer_info().expect("server info should be initialized");
    assert_eq!(info.server_info.name, "qdrant-loader-mcp");
    assert!(info.capabilities.tools.is_some());

    let tools_result = service.list_tools(Some(PaginatedRequestParam { cursor: None })).await.expect("list_tools");
    let names: Vec<_> = tools_result.tools.iter().map(|tool| tool.name.as_ref()).collect();

    assert!(names.contains(&"search"));
    assert!(names.contains(&"hierarchy_search"));
    assert!(names.contains(&"attachment_search"));

    harness.shutdown().await;
}

#[tokio::test]
async fn search_tool_returns_results() {
    let qdrant_server = MockServer::start_async().await;
    let llm_server = MockServer::start_async().await;

    let _embed_mock = llm_server
        .mock_async(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200).json_body(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3] }]
            }));
        })
        .await;
    let _query_mock = qdrant_server
        .mock_async(|when, then| {
            when.method(POST).path("/collections/docs/points/query");
            then.status(200).json_body(json!({
                "result": [
                    {
                        "id": "11111111-1111-1111-1111-111111111111",
                        "score": 0.92,
                        "payload": {
                            "project_id": "default",
                            "document_id": "doc-1",
                            "chunk_index": 0,
                            "content": "Example chunk content",
                            "source_type": "localfile",
                            "source_name": "docs",
                            "url": "file:///docs/a.md",
                            "title": "A doc"
                        }
                    }
                ]
            }));
        })
        .await;

    let harness = TestHarness::new(&qdrant_server.base_url(), &llm_server.base_url()).await;
    let service = &harness.service;

    let response = service
        .call_tool(CallToolRequestParam {
            name: "search".into(),
            arguments: Some(json!({ "query": "example query" }).as_object().unwrap().clone()),
        })
        .await
        .expect("search tool call");

    assert_eq!(response.is_error, Some(false));

    let content = response.content.expect("rendered text content block");
    let text = content[0].as_text().expect("first content block is text").text.clone();
    assert!(text.contains("a.md"), "summary text should mention the matched document: {text}");

    let payload = response.structured_content.expect("structured search payload");
    let results = payload["results"].as_array().expect("results array");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["document_id"], "doc-1");
    assert_eq!(results[0]["title"], "A doc");

    harness.shutdown().await;
}

#[tokio::test]
async fn invalid_payload_returns_error() {
    let qdrant_server = MockServer::start_async().await;
    let llm_server = MockServer::start_async().await;
    let harness = TestHarness::new(&qdrant_server.base_url(), &llm_server.base_url()).await;
    let service = &harness.service;

    let err = service
        .call_tool(CallToolRequestParam {
            name: "search".into(),
            arguments: Some(json!({ "query": "" }).as_object().unwrap().clone()),
        })
        .await
        .expect_err("empty query should fail");

    match err {
        rmcp::service::ServiceError::McpError(data) => {
            assert_eq!(data.code, model::ErrorCode::INVALID_PARAMS);
        }
        other => panic!("expected MCP error, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_tool_returns_error() {
    let qdrant_server = MockServer::start_async().await;
    let llm_server = MockServer::start_async().await;
    let harness = TestHarness::new(&qdrant_server.base_url(), &llm_server.base_url()).await;
    let service = &harness.service;

    let err = service
        .call_tool(CallToolRequestParam {
            name: "not_a_real_tool".into(),
            arguments: Some(json!({}).as_object().unwrap().clone()),
        })
        .await
        .expect_err("unknown tool should fail");

    match err {
        rmcp::service::ServiceError::McpError(data) => {
            assert_eq!(data.code, model::ErrorCode::INVALID_PARAMS);
        }
        other => panic!("expected MCP error, got {other:?}"),
    }

    harness.shutdown().await;
}
