//! Top-level error taxonomy shared across components.
//!
//! Every component-local `thiserror` enum (state store, HTTP client,
//! embedding client, Qdrant client, converter, chunker) maps into one of the
//! seven kinds below via `From` impls, so the CLI and the MCP server each
//! have a single place to decide exit codes / JSON-RPC error codes from.

use thiserror::Error;

/// The seven error kinds a qdrant-loader component can raise.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Missing env var, invalid YAML, schema violation, unresolved `${VAR}`.
    /// Always fatal before any work begins.
    #[error("configuration error: {0}")]
    Config(String),
    /// 401/403 from an upstream source or embedding provider.
    #[error("authentication error: {0}")]
    Auth(String),
    /// Network timeout, 5xx, 429, connection reset, retried and exhausted.
    #[error("transient error: {0}")]
    Transient(String),
    /// 4xx other than auth; bad parameters to an MCP tool.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Converter failed or exceeded its size/time budget.
    #[error("conversion error: {0}")]
    Conversion(String),
    /// State store I/O error. Fatal: cannot proceed without durable bookkeeping.
    #[error("state store error: {0}")]
    State(String),
    /// Cooperative shutdown signal received. Not an error at the process level.
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind should abort the whole process immediately (§7: Config, State).
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, ErrorKind::Config(_) | ErrorKind::State(_))
    }

    /// JSON-RPC 2.0 error code per §4.12.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ErrorKind::InvalidRequest(_) => -32602,
            ErrorKind::Auth(_) => -32000,
            ErrorKind::Transient(_) => -32001,
            ErrorKind::Conversion(_) => -32002,
            ErrorKind::State(_) => -32003,
            ErrorKind::Config(_) => -32004,
            ErrorKind::Cancelled => -32005,
        }
    }
}

/// Convenience alias for fallible top-level operations.
pub type Result<T> = std::result::Result<T, ErrorKind>;
