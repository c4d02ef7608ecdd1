#![deny(missing_docs)]

//! Core library for qdrant-loader: ingestion pipeline + MCP search server.

/// CLI subcommands and their exit-code contracts.
pub mod cli;
/// Plain-text/markup conversion from raw source bytes.
pub mod convert;
/// Token-budgeted chunking (structured + fallback modes).
pub mod chunk;
/// YAML-driven configuration, loaded once at startup.
pub mod config;
/// Embedding provider abstraction and adapters.
pub mod embedding;
/// Top-level error taxonomy shared across components.
pub mod error;
/// Rate-limited, retrying HTTP client shared by adapters and embedding clients.
pub mod http_client;
/// Stable document identity and content hashing.
pub mod identity;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion run counters.
pub mod metrics;
/// Core data model shared by every component.
pub mod model;
/// The ingestion orchestrator pipeline.
pub mod orchestrator;
/// Qdrant vector store integration.
pub mod qdrant;
/// Signal-driven cooperative shutdown.
pub mod resource_manager;
/// Search service: semantic, hierarchy, and attachment search.
pub mod search;
/// Document source adapters (git, confluence, jira, publicdocs, localfile).
pub mod sources;
/// Embedded SQLite-backed state store.
pub mod state_store;

/// Model Context Protocol server implementation.
pub mod mcp;
