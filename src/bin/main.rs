//! `qdrant-loader` entrypoint: `init`, `ingest`, `config`, `project` (§6).
//!
//! Kept to a parse-dispatch-exit shape (§9: sub-commands declare their own
//! dependency closure; nothing else is linked or instantiated at process
//! start).

use clap::Parser;
use qdrant_loader::cli::{self, Cli};
use qdrant_loader::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_tracing();
    let code = cli::run(cli).await;
    std::process::exit(code);
}
