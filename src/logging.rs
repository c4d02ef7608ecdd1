//! Tracing configuration and log routing (§6).
//!
//! The MCP server speaks JSON-RPC over stdout, so logs must never land
//! there: the console layer always writes to stderr. `MCP_LOG_LEVEL` takes
//! precedence over `RUST_LOG`; `MCP_LOG_FILE` adds a non-blocking file
//! layer; `MCP_DISABLE_CONSOLE_LOGGING=true` drops the stderr layer
//! entirely (useful when a supervisor already captures the file).

use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber. Safe to call once per process;
/// a second call is a no-op (tracing itself rejects double-init).
pub fn init_tracing() {
    let env_filter = std::env::var("MCP_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_disabled = std::env::var("MCP_DISABLE_CONSOLE_LOGGING")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    let console_layer = (!console_disabled).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    let file_layer = configure_file_writer().map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact()
    });

    let _ = registry.with(console_layer).with(file_layer).try_init();
}

/// Build a non-blocking writer for `MCP_LOG_FILE`, if set.
fn configure_file_writer() -> Option<NonBlocking> {
    let path = std::env::var("MCP_LOG_FILE").ok()?;
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("failed to open log file {path}: {err}");
            None
        }
    }
}
