//! CLI subcommands and their exit-code contracts (§6).
//!
//! Each subcommand is a thin wrapper over the library: load configuration,
//! build the handful of shared clients (§5: "process-wide, constructed once
//! at startup from config"), and call into [`crate::orchestrator`] or
//! [`crate::search`]. Mirrors the teacher's `main.rs`/`init_config`
//! separation, generalized from one HTTP server entrypoint into four
//! subcommands that each declare their own dependency closure (§9:
//! "sub-commands declare their own dependency closure and nothing else is
//! linked").

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::embedding::build_embedding_client;
use crate::http_client::{RateLimitedHttpClient, RetryPolicy};
use crate::model::{IngestionRun, SourceType};
use crate::orchestrator::{self, IngestFilter, IngestionHandles};
use crate::qdrant::QdrantService;
use crate::resource_manager::ResourceManager;
use crate::sources::{self, ProjectContext};
use crate::state_store::StateStore;

/// Exit code: the operation succeeded.
pub const EXIT_OK: i32 = 0;
/// Exit code: configuration was missing, malformed, or failed validation.
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Exit code: could not reach a required external service (Qdrant, the LLM provider).
pub const EXIT_CONNECTION_ERROR: i32 = 3;
/// Exit code: one or more sources failed authentication.
pub const EXIT_AUTH_ERROR: i32 = 4;
/// Exit code: `ingest` produced zero successful documents and at least one source errored.
pub const EXIT_INGEST_TOTAL_FAILURE: i32 = 5;

/// `qdrant-loader` top-level CLI (§6).
#[derive(Debug, Parser)]
#[command(name = "qdrant-loader", version, about = "Ingests heterogeneous content sources into Qdrant.")]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Every subcommand this binary exposes (§6).
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create (or recreate) the configured Qdrant collection.
    Init {
        /// Delete and recreate the collection if it already exists.
        #[arg(long)]
        force: bool,
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Run ingestion for one or every configured project.
    Ingest {
        /// Restrict the run to this project id.
        #[arg(long = "project")]
        project: Option<String>,
        /// Restrict the run to sources of this type.
        #[arg(long = "source-type")]
        source_type: Option<String>,
        /// Restrict the run to the source instance with this name.
        #[arg(long = "source")]
        source: Option<String>,
        /// Log per-project timing after the run completes.
        #[arg(long)]
        profile: bool,
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Print the resolved configuration, secrets redacted.
    Config {
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Inspect configured projects.
    Project {
        /// The project action to perform.
        #[command(subcommand)]
        action: ProjectAction,
    },
}

/// `project` subcommands (§6).
#[derive(Debug, Subcommand)]
pub enum ProjectAction {
    /// List every configured project.
    List {
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
        /// Output format.
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Show ingestion status (document counts, last run) for a project.
    Status {
        /// Restrict the report to this project id; all projects if unset.
        #[arg(long = "project-id")]
        project_id: Option<String>,
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
        /// Output format.
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Attempt one enumeration step against every configured source and
    /// report auth/connectivity problems without writing anything.
    Validate {
        /// Restrict validation to this project id; all projects if unset.
        #[arg(long = "project-id")]
        project_id: Option<String>,
        /// Workspace directory containing `config.yaml`.
        #[arg(long)]
        workspace: PathBuf,
        /// Output format.
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

/// `--format` values shared by every `project` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable aligned columns.
    Table,
    /// Machine-readable JSON.
    Json,
}

/// Dispatch a parsed [`Cli`] and return the process exit code.
pub async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Init { force, workspace } => cmd_init(force, &workspace).await,
        Command::Ingest { project, source_type, source, profile, workspace } => {
            cmd_ingest(project, source_type, source, profile, &workspace).await
        }
        Command::Config { workspace } => cmd_config(&workspace),
        Command::Project { action } => match action {
            ProjectAction::List { workspace, format } => cmd_project_list(&workspace, format),
            ProjectAction::Status { project_id, workspace, format } => {
                cmd_project_status(project_id, &workspace, format).await
            }
            ProjectAction::Validate { project_id, workspace, format } => {
                cmd_project_validate(project_id, &workspace, format).await
            }
        },
    }
}

fn config_path(workspace: &Path) -> PathBuf {
    workspace.join("config.yaml")
}

fn load_config_or_exit(workspace: &Path) -> Result<Config, i32> {
    match Config::load(&config_path(workspace)) {
        Ok(config) => Ok(config),
        Err(err) => {
            report_config_error(&err);
            Err(EXIT_CONFIG_ERROR)
        }
    }
}

fn report_config_error(err: &ConfigError) {
    eprintln!("qdrant-loader: configuration error: {err}");
}

async fn cmd_init(force: bool, workspace: &Path) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let qdrant = match QdrantService::new(&config.global.qdrant) {
        Ok(q) => q,
        Err(err) => {
            eprintln!("qdrant-loader: could not build Qdrant client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    let embedding = match build_embedding_client(&config.global.llm) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("qdrant-loader: could not build embedding client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    match qdrant
        .init_collection(&config.global.qdrant.collection_name, embedding.vector_size() as u64, force)
        .await
    {
        Ok(()) => {
            println!(
                "Collection '{}' ready at {}",
                config.global.qdrant.collection_name, config.global.qdrant.url
            );
            EXIT_OK
        }
        Err(err) => {
            eprintln!("qdrant-loader: failed to initialize collection: {err}");
            EXIT_CONNECTION_ERROR
        }
    }
}

async fn cmd_ingest(
    project: Option<String>,
    source_type: Option<String>,
    source: Option<String>,
    profile: bool,
    workspace: &Path,
) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let source_type = match source_type.map(|s| parse_source_type(&s)) {
        Some(Ok(t)) => Some(t),
        Some(Err(err)) => {
            eprintln!("qdrant-loader: {err}");
            return EXIT_CONFIG_ERROR;
        }
        None => None,
    };
    let filter = IngestFilter { source_type, source_name: source };

    let project_ids: Vec<String> = match &project {
        Some(id) if config.projects.contains_key(id) => vec![id.clone()],
        Some(id) => {
            eprintln!("qdrant-loader: unknown project '{id}'");
            return EXIT_CONFIG_ERROR;
        }
        None => config.projects.keys().cloned().collect(),
    };

    let qdrant = match QdrantService::new(&config.global.qdrant) {
        Ok(q) => Arc::new(q),
        Err(err) => {
            eprintln!("qdrant-loader: could not build Qdrant client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };
    let embedding: Arc<dyn crate::embedding::EmbeddingClient> = match build_embedding_client(&config.global.llm) {
        Ok(client) => Arc::from(client),
        Err(err) => {
            eprintln!("qdrant-loader: could not build embedding client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };
    let http = Arc::new(match RateLimitedHttpClient::new(RetryPolicy::default()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("qdrant-loader: could not build HTTP client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    });

    let db_path = resolve_relative(workspace, &config.global.state.database_path);
    let state = match StateStore::open(&db_path).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("qdrant-loader: state store error: {err}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let cache_dir = resolve_relative(workspace, ".qdrant-loader-cache");
    let resources = Arc::new(ResourceManager::new(Duration::from_secs(config.global.orchestrator.drain_deadline_s)));
    let cancel = resources.cancellation_token();

    let run_projects = async {
        let mut aggregate_succeeded = 0u64;
        let mut aggregate_failed = 0u64;
        let mut any_source_failed = false;
        let mut runs: Vec<(String, IngestionRun, Duration)> = Vec::new();

        for project_id in &project_ids {
            if cancel.is_cancelled() {
                eprintln!("qdrant-loader: shutdown requested, stopping before project '{project_id}'");
                break;
            }
            let handles = IngestionHandles {
                state: state.clone(),
                qdrant: Arc::clone(&qdrant),
                embedding: Arc::clone(&embedding),
                http: Arc::clone(&http),
                cache_dir: cache_dir.clone(),
                cancel: cancel.clone(),
            };
            let started = Instant::now();
            match orchestrator::run_project(&config, project_id, &filter, handles).await {
                Ok(run) => {
                    aggregate_succeeded += run.documents_new + run.documents_updated + run.documents_unchanged;
                    aggregate_failed += run.documents_failed;
                    any_source_failed |= !run.sources_failed.is_empty();
                    print_run_summary(project_id, &run);
                    runs.push((project_id.clone(), run, started.elapsed()));
                }
                Err(err) => {
                    eprintln!("qdrant-loader: project '{project_id}' failed: {err}");
                    return EXIT_CONFIG_ERROR;
                }
            }
        }

        if profile {
            for (project_id, _, elapsed) in &runs {
                tracing::info!(project_id, elapsed_ms = elapsed.as_millis() as u64, "project ingestion timing");
            }
        }

        let _ = aggregate_failed;
        if aggregate_succeeded == 0 && any_source_failed {
            EXIT_INGEST_TOTAL_FAILURE
        } else {
            EXIT_OK
        }
    };

    let code = tokio::select! {
        code = run_projects => code,
        () = resources.run_until_shutdown() => EXIT_OK,
    };

    state.close().await;
    code
}

fn print_run_summary(project_id: &str, run: &IngestionRun) {
    println!(
        "project '{project_id}': seen={} new={} updated={} unchanged={} failed={} chunks_written={} embeddings_made={}",
        run.documents_seen,
        run.documents_new,
        run.documents_updated,
        run.documents_unchanged,
        run.documents_failed,
        run.chunks_written,
        run.embeddings_made,
    );
    if !run.sources_failed.is_empty() {
        let names: Vec<String> = run
            .sources_failed
            .iter()
            .map(|(t, n)| format!("{t}:{n}"))
            .collect();
        println!("  sources with fatal errors: {}", names.join(", "));
    }
}

fn cmd_config(workspace: &Path) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };
    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            print!("{yaml}");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("qdrant-loader: failed to render configuration: {err}");
            EXIT_CONFIG_ERROR
        }
    }
}

fn cmd_project_list(workspace: &Path, format: OutputFormat) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match format {
        OutputFormat::Table => {
            println!("{:<24} {:<32} SOURCES", "PROJECT_ID", "DISPLAY_NAME");
            for (project_id, project) in &config.projects {
                let display_name = project.display_name.clone().unwrap_or_else(|| project_id.clone());
                let source_count: usize = project.sources.values().map(|m| m.len()).sum();
                println!("{project_id:<24} {display_name:<32} {source_count}");
            }
        }
        OutputFormat::Json => {
            let items: Vec<_> = config
                .projects
                .iter()
                .map(|(project_id, project)| {
                    serde_json::json!({
                        "project_id": project_id,
                        "display_name": project.display_name.clone().unwrap_or_else(|| project_id.clone()),
                        "source_count": project.sources.values().map(|m| m.len()).sum::<usize>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items).expect("json list"));
        }
    }
    EXIT_OK
}

async fn cmd_project_status(project_id: Option<String>, workspace: &Path, format: OutputFormat) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let project_ids: Vec<String> = match &project_id {
        Some(id) if config.projects.contains_key(id) => vec![id.clone()],
        Some(id) => {
            eprintln!("qdrant-loader: unknown project '{id}'");
            return EXIT_CONFIG_ERROR;
        }
        None => config.projects.keys().cloned().collect(),
    };

    let db_path = resolve_relative(workspace, &config.global.state.database_path);
    let state = match StateStore::open(&db_path).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("qdrant-loader: state store error: {err}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let qdrant = match QdrantService::new(&config.global.qdrant) {
        Ok(q) => q,
        Err(err) => {
            eprintln!("qdrant-loader: could not build Qdrant client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    let mut rows = Vec::new();
    for pid in &project_ids {
        let Some(project) = config.resolve_project(pid) else { continue };
        let mut tracked = 0usize;
        for (source_name, source_config) in &project.source_configs {
            let ids = state
                .known_document_ids(pid, source_config.source_type(), source_name)
                .await
                .unwrap_or_default();
            tracked += ids.len();
        }
        let point_count = count_points(&qdrant, &project.collection_name, pid).await;
        rows.push((pid.clone(), tracked, point_count));
    }
    state.close().await;

    match format {
        OutputFormat::Table => {
            println!("{:<24} {:>16} {:>12}", "PROJECT_ID", "TRACKED_DOCS", "QDRANT_POINTS");
            for (pid, tracked, points) in &rows {
                println!("{pid:<24} {tracked:>16} {points:>12}");
            }
        }
        OutputFormat::Json => {
            let items: Vec<_> = rows
                .iter()
                .map(|(pid, tracked, points)| {
                    serde_json::json!({ "project_id": pid, "tracked_documents": tracked, "qdrant_points": points })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items).expect("json status"));
        }
    }
    EXIT_OK
}

async fn count_points(qdrant: &QdrantService, collection_name: &str, project_id: &str) -> usize {
    use futures_util::StreamExt;

    let filter = crate::qdrant::build_filter(&crate::qdrant::SearchFilterArgs::for_project(project_id));
    let stream = crate::qdrant::stream_payloads_with_ids(qdrant, collection_name, serde_json::json!(false), filter);
    futures_util::pin_mut!(stream);
    let mut count = 0usize;
    while let Some(item) = stream.next().await {
        if item.is_ok() {
            count += 1;
        } else {
            break;
        }
    }
    count
}

async fn cmd_project_validate(project_id: Option<String>, workspace: &Path, format: OutputFormat) -> i32 {
    let config = match load_config_or_exit(workspace) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let project_ids: Vec<String> = match &project_id {
        Some(id) if config.projects.contains_key(id) => vec![id.clone()],
        Some(id) => {
            eprintln!("qdrant-loader: unknown project '{id}'");
            return EXIT_CONFIG_ERROR;
        }
        None => config.projects.keys().cloned().collect(),
    };

    let http = Arc::new(match RateLimitedHttpClient::new(RetryPolicy::default()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("qdrant-loader: could not build HTTP client: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    });
    let cache_dir = resolve_relative(workspace, ".qdrant-loader-cache");
    let cancel = CancellationToken::new();

    let mut rows: Vec<(String, String, String)> = Vec::new();
    let mut any_auth_failed = false;
    let mut any_invalid = false;

    for pid in &project_ids {
        let Some(project) = config.resolve_project(pid) else { continue };
        let project_ctx = ProjectContext {
            project_id: pid.clone(),
            http: Arc::clone(&http),
            cache_dir: cache_dir.clone(),
            max_file_size: config.global.file_conversion.max_file_size,
            conversion_timeout: Duration::from_secs(config.global.file_conversion.conversion_timeout_s),
            cancel: cancel.clone(),
        };
        for (source_name, source_config) in &project.source_configs {
            let source_type = source_config.source_type();
            let status = match sources::build_source(source_name, source_config) {
                Ok(source) => validate_one(source.as_ref(), &project_ctx).await,
                Err(err) => {
                    any_invalid = true;
                    format!("invalid config: {err}")
                }
            };
            if status.starts_with("auth failed") {
                any_auth_failed = true;
            }
            rows.push((pid.clone(), format!("{source_type}:{source_name}"), status));
        }
    }

    match format {
        OutputFormat::Table => {
            println!("{:<16} {:<28} STATUS", "PROJECT_ID", "SOURCE");
            for (pid, source, status) in &rows {
                println!("{pid:<16} {source:<28} {status}");
            }
        }
        OutputFormat::Json => {
            let items: Vec<_> = rows
                .iter()
                .map(|(pid, source, status)| serde_json::json!({ "project_id": pid, "source": source, "status": status }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items).expect("json validate"));
        }
    }

    if any_auth_failed {
        EXIT_AUTH_ERROR
    } else if any_invalid {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_OK
    }
}

async fn validate_one(source: &dyn crate::sources::DocumentSource, ctx: &ProjectContext) -> String {
    use futures_util::StreamExt;

    let stream = source.enumerate(ctx);
    futures_util::pin_mut!(stream);
    match tokio::time::timeout(Duration::from_secs(30), stream.next()).await {
        Ok(Some(Ok(_))) | Ok(None) => "ok".to_string(),
        Ok(Some(Err(err))) => {
            let kind: crate::error::ErrorKind = err.into();
            match kind {
                crate::error::ErrorKind::Auth(msg) => format!("auth failed: {msg}"),
                other => format!("error: {other}"),
            }
        }
        Err(_) => "error: timed out".to_string(),
    }
}

fn parse_source_type(value: &str) -> Result<SourceType, String> {
    match value.to_lowercase().as_str() {
        "git" => Ok(SourceType::Git),
        "confluence" => Ok(SourceType::Confluence),
        "jira" => Ok(SourceType::Jira),
        "publicdocs" => Ok(SourceType::Publicdocs),
        "localfile" => Ok(SourceType::Localfile),
        other => Err(format!("unknown source type '{other}'")),
    }
}

fn resolve_relative(workspace: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_joins_workspace() {
        let path = config_path(Path::new("/tmp/ws"));
        assert_eq!(path, PathBuf::from("/tmp/ws/config.yaml"));
    }

    #[test]
    fn resolve_relative_keeps_absolute_paths() {
        let resolved = resolve_relative(Path::new("/tmp/ws"), "/var/lib/state.db");
        assert_eq!(resolved, PathBuf::from("/var/lib/state.db"));
    }

    #[test]
    fn resolve_relative_joins_relative_paths() {
        let resolved = resolve_relative(Path::new("/tmp/ws"), "state.db");
        assert_eq!(resolved, PathBuf::from("/tmp/ws/state.db"));
    }

    #[test]
    fn parse_source_type_accepts_known_values() {
        assert!(matches!(parse_source_type("git"), Ok(SourceType::Git)));
        assert!(matches!(parse_source_type("LOCALFILE"), Ok(SourceType::Localfile)));
        assert!(parse_source_type("bogus").is_err());
    }
}
