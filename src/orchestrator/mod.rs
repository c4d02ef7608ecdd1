//! Ingestion orchestrator: per-project discover → classify → chunk → embed →
//! upsert pipeline (§4.8).
//!
//! `DocumentSource::enumerate` already performs discovery and fetch/convert
//! together (see `src/sources/mod.rs`'s doc comment), so this module's stage
//! split differs from the three-pool description in spirit but not in
//! effect: each configured source drives its own stream concurrently (bounded
//! by `fetch_concurrency` sources in flight at once, the discovery/fetch
//! stage), classifying every Document against the state store and handing
//! new/updated ones to a single chunk/embed/upsert stage shared by the whole
//! project run (bounded by `embed_concurrency` in-flight batches). Builds on
//! the chunk-embed-index sequencing of a single-document `process_and_index`
//! call, generalized from "chunk, embed, and index one document" to "drain a
//! channel of documents, batching chunks up to `embed_batch` across
//! documents before each embed+upsert call."

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::{ChunkingError, ChunkingOptions, chunk_document};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::ErrorKind;
use crate::http_client::{RateLimitedHttpClient, full_jitter_backoff};
use crate::metrics::RunMetrics;
use crate::model::{Chunk, Document, IngestionRun, SourceType, StateKey, StateRecord, VectorPayload, VectorRecord};
use crate::qdrant::{QdrantError, QdrantService, SearchFilterArgs, point_id};
use crate::sources::{self, DocumentSource, ProjectContext, SourceError};
use crate::state_store::{StateStore, StateStoreError};

/// Errors raised while preparing or running one ingestion invocation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No project with this id is configured.
    #[error("unknown project '{0}'")]
    UnknownProject(String),
    /// A state store operation failed.
    #[error(transparent)]
    State(#[from] StateStoreError),
    /// A Qdrant operation failed.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
    /// A source adapter failed outside the per-source error handling path.
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<OrchestratorError> for ErrorKind {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::UnknownProject(id) => ErrorKind::Config(format!("unknown project '{id}'")),
            OrchestratorError::State(err) => err.into(),
            OrchestratorError::Qdrant(err) => err.into(),
            OrchestratorError::Source(err) => err.into(),
        }
    }
}

/// Restricts an `ingest` run to a subset of a project's configured sources
/// (§6 `--source-type`/`--source`). Both fields unset means "every source".
#[derive(Debug, Clone, Default)]
pub struct IngestFilter {
    /// Keep only sources of this type.
    pub source_type: Option<SourceType>,
    /// Keep only the source instance with this name.
    pub source_name: Option<String>,
}

impl IngestFilter {
    fn matches(&self, source_type: SourceType, source_name: &str) -> bool {
        if let Some(t) = self.source_type {
            if t != source_type {
                return false;
            }
        }
        if let Some(name) = &self.source_name {
            if name != source_name {
                return false;
            }
        }
        true
    }
}

/// Everything one `run_project` call needs, collected so the call site
/// doesn't thread a dozen parameters through every helper.
pub struct IngestionHandles {
    /// The state store recording per-document progress.
    pub state: StateStore,
    /// The Qdrant client used for upserts, deletes, and collection setup.
    pub qdrant: Arc<QdrantService>,
    /// The embedding client used to vectorize chunk text.
    pub embedding: Arc<dyn EmbeddingClient>,
    /// The shared rate-limited HTTP client handed to every source adapter.
    pub http: Arc<RateLimitedHttpClient>,
    /// Scratch directory for adapters needing local state (e.g. git clones).
    pub cache_dir: PathBuf,
    /// Cancellation token polled by every long-running stage.
    pub cancel: CancellationToken,
}

/// Run ingestion for one configured project, draining every matching source
/// to completion, and return the aggregate counters (§4.8 algorithm).
pub async fn run_project(
    config: &Config,
    project_id: &str,
    filter: &IngestFilter,
    handles: IngestionHandles,
) -> Result<IngestionRun, OrchestratorError> {
    let project = config
        .resolve_project(project_id)
        .ok_or_else(|| OrchestratorError::UnknownProject(project_id.to_string()))?;

    let IngestionHandles {
        state,
        qdrant,
        embedding,
        http,
        cache_dir,
        cancel,
    } = handles;

    let run_id = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    tracing::info!(run_id, project_id, "ingestion run starting");

    qdrant
        .init_collection(&project.collection_name, embedding.vector_size() as u64, false)
        .await?;

    let metrics = Arc::new(RunMetrics::new());
    let chunking = ChunkingOptions {
        chunk_size: config.global.chunking.chunk_size,
        chunk_overlap: config.global.chunking.chunk_overlap,
        max_chunk_bytes: config.global.chunking.max_chunk_bytes,
        tokenizer_model: config.global.llm.models.embeddings.clone(),
    };

    let ctx = Arc::new(RunContext {
        project_id: project.project_id.clone(),
        collection_name: project.collection_name.clone(),
        state,
        qdrant,
        embedding,
        chunking,
        cancel: cancel.clone(),
        metrics: Arc::clone(&metrics),
        embed_batch: config.global.orchestrator.embed_batch.max(1),
        qdrant_batch_size: config.global.qdrant.batch_size.max(1),
        embed_concurrency: config.global.orchestrator.embed_concurrency.max(1),
    });

    let selected: Vec<(String, crate::config::SourceConfig)> = project
        .source_configs
        .into_iter()
        .filter(|(name, cfg)| filter.matches(cfg.source_type(), name))
        .collect();

    let (tx, rx) = mpsc::channel::<ClassifiedDocument>(ctx.embed_batch);

    let discovery = {
        let ctx = Arc::clone(&ctx);
        let http = Arc::clone(&http);
        let cache_dir = cache_dir.clone();
        let fetch_concurrency = config.global.orchestrator.fetch_concurrency.max(1);
        async move {
            let project_ctx = ProjectContext {
                project_id: ctx.project_id.clone(),
                http,
                cache_dir,
                max_file_size: config.global.file_conversion.max_file_size,
                conversion_timeout: Duration::from_secs(config.global.file_conversion.conversion_timeout_s),
                cancel: ctx.cancel.clone(),
            };

            stream::iter(selected.into_iter().map(|(name, source_config)| {
                let ctx = Arc::clone(&ctx);
                let project_ctx = project_ctx.clone();
                let tx = tx.clone();
                async move { run_source(ctx, name, source_config, project_ctx, tx).await }
            }))
            .buffer_unordered(fetch_concurrency)
            .collect::<Vec<()>>()
            .await;
        }
    };

    let consumer = drain_and_embed(Arc::clone(&ctx), rx);

    let (_, ()) = tokio::join!(discovery, consumer);

    let finished_at = Utc::now();
    let mut run = metrics.snapshot(run_id);
    run.started_at = Some(started_at);
    run.finished_at = Some(finished_at);
    ctx.state.record_run(&run).await?;
    tracing::info!(
        run_id = %run.run_id,
        seen = run.documents_seen,
        new = run.documents_new,
        updated = run.documents_updated,
        unchanged = run.documents_unchanged,
        failed = run.documents_failed,
        chunks = run.chunks_written,
        "ingestion run finished"
    );
    Ok(run)
}

/// Everything the discovery and embed/upsert stages share for the duration
/// of one run. Cheap to clone behind an `Arc`.
struct RunContext {
    project_id: String,
    collection_name: String,
    state: StateStore,
    qdrant: Arc<QdrantService>,
    embedding: Arc<dyn EmbeddingClient>,
    chunking: ChunkingOptions,
    cancel: CancellationToken,
    metrics: Arc<RunMetrics>,
    embed_batch: usize,
    qdrant_batch_size: usize,
    embed_concurrency: usize,
}

/// A Document that survived classification and needs chunking/embedding.
struct ClassifiedDocument {
    document: Document,
    is_new: bool,
}

/// Drive one configured source's stream to completion: classify every
/// Document against the state store, route new/updated ones to `tx`, and
/// (if the stream ended cleanly) sweep orphans for this `(source_type,
/// source_name)` (§4.8 steps 2-4, §9 orphan-sweep-on-error resolution).
async fn run_source(
    ctx: Arc<RunContext>,
    source_name: String,
    source_config: crate::config::SourceConfig,
    project_ctx: ProjectContext,
    tx: mpsc::Sender<ClassifiedDocument>,
) {
    let source_type = source_config.source_type();
    let source = match sources::build_source(&source_name, &source_config) {
        Ok(source) => source,
        Err(err) => {
            tracing::error!(source_type = %source_type, source_name, error = %err, "failed to build source adapter");
            ctx.metrics.record_source_failed(source_type.as_str(), &source_name);
            return;
        }
    };

    let known_ids: BTreeSet<String> = match ctx
        .state
        .known_document_ids(&ctx.project_id, source_type, &source_name)
        .await
    {
        Ok(ids) => ids.into_iter().collect(),
        Err(err) => {
            tracing::error!(source_type = %source_type, source_name, error = %err, "failed to load known document ids");
            ctx.metrics.record_source_failed(source_type.as_str(), &source_name);
            return;
        }
    };

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut clean_completion = true;

    let stream = source.enumerate(&project_ctx);
    futures_util::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            tracing::warn!(source_type = %source_type, source_name, "cancellation requested, stopping discovery");
            clean_completion = false;
            break;
        }
        let document = match item {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(source_type = %source_type, source_name, error = %err, "source enumeration failed");
                ctx.metrics.record_source_failed(source_type.as_str(), &source_name);
                clean_completion = false;
                break;
            }
        };

        ctx.metrics.record_seen();
        seen.insert(document.id.clone());

        if document.is_deleted {
            apply_inline_delete(&ctx, source_type, &source_name, &document.id).await;
            continue;
        }

        match classify(&ctx, source_type, &source_name, &document).await {
            Ok(Classification::Unchanged) => {
                ctx.metrics.record_unchanged();
            }
            Ok(Classification::New) => {
                if tx.send(ClassifiedDocument { document, is_new: true }).await.is_err() {
                    break;
                }
            }
            Ok(Classification::Updated) => {
                if tx.send(ClassifiedDocument { document, is_new: false }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(source_type = %source_type, source_name, document_id = document.id, error = %err, "classification failed");
                ctx.metrics.record_failed();
            }
        }
    }

    if clean_completion {
        sweep_orphans(&ctx, source_type, &source_name, &known_ids, &seen).await;
    } else {
        tracing::warn!(
            source_type = %source_type,
            source_name,
            "skipping orphan sweep: discovery did not complete cleanly"
        );
    }
}

enum Classification {
    Unchanged,
    New,
    Updated,
}

/// Classify one Document against its `StateRecord` (§4.8 step 3). The
/// content hash fetched here is always the authoritative one (adapters hand
/// back full Documents, not cheap headers), so there is no separate
/// downgrade-after-fetch step: the comparison below already uses it.
async fn classify(
    ctx: &RunContext,
    source_type: SourceType,
    source_name: &str,
    document: &Document,
) -> Result<Classification, StateStoreError> {
    let key = StateKey {
        project_id: ctx.project_id.clone(),
        source_type,
        source_name: source_name.to_string(),
        document_id: document.id.clone(),
    };
    let content_hash = document.content_hash();
    match ctx.state.get(&key).await? {
        None => Ok(Classification::New),
        Some(record) if record.content_hash == content_hash => {
            let mut bumped = record;
            bumped.last_ingested_at = Utc::now();
            ctx.state.upsert(&bumped).await?;
            Ok(Classification::Unchanged)
        }
        Some(_) => Ok(Classification::Updated),
    }
}

/// Apply a tombstone for a Document an adapter itself reported as deleted
/// (as opposed to one discovered missing by orphan sweep), §4.7/§4.8.
async fn apply_inline_delete(ctx: &RunContext, source_type: SourceType, source_name: &str, document_id: &str) {
    let key = StateKey {
        project_id: ctx.project_id.clone(),
        source_type,
        source_name: source_name.to_string(),
        document_id: document_id.to_string(),
    };
    if let Err(err) = ctx.qdrant.delete_by_document(&ctx.collection_name, &ctx.project_id, document_id).await {
        tracing::warn!(document_id, error = %err, "failed to delete points for inline-deleted document");
    }
    if let Err(err) = ctx.state.mark_deleted(&key).await {
        tracing::warn!(document_id, error = %err, "failed to mark inline-deleted document in state store");
    }
}

/// Tombstone and delete every document known to the state store but not
/// re-seen during this run's discovery (§4.8 step 4).
async fn sweep_orphans(
    ctx: &RunContext,
    source_type: SourceType,
    source_name: &str,
    known_ids: &BTreeSet<String>,
    seen: &BTreeSet<String>,
) {
    for orphan_id in known_ids.difference(seen) {
        tracing::info!(source_type = %source_type, source_name, document_id = orphan_id, "sweeping orphaned document");
        apply_inline_delete(ctx, source_type, source_name, orphan_id).await;
    }
}

/// Drain the classified-document channel, chunking each Document and
/// accumulating chunks across Documents up to `embed_batch` before each
/// embed+upsert call (§4.8 step 3/embed-upsert pool).
async fn drain_and_embed(ctx: Arc<RunContext>, mut rx: mpsc::Receiver<ClassifiedDocument>) {
    let semaphore = Arc::new(Semaphore::new(ctx.embed_concurrency));
    let mut in_flight = JoinSet::new();
    let mut pending: Vec<PendingDocument> = Vec::new();
    let mut pending_chunks = 0usize;

    while let Some(classified) = rx.recv().await {
        let ClassifiedDocument { document, is_new } = classified;
        match chunk_document(&document.id, &document.content, &document.content_type, &ctx.chunking) {
            Ok(chunks) => {
                pending_chunks += chunks.len();
                pending.push(PendingDocument { document, is_new, chunks });
            }
            Err(err) => {
                record_chunking_failure(&ctx, &document, err).await;
            }
        }

        if pending_chunks >= ctx.embed_batch {
            let batch = std::mem::take(&mut pending);
            pending_chunks = 0;
            spawn_flush(&ctx, &semaphore, &mut in_flight, batch).await;
        }
    }

    if !pending.is_empty() {
        spawn_flush(&ctx, &semaphore, &mut in_flight, pending).await;
    }

    while in_flight.join_next().await.is_some() {}
}

struct PendingDocument {
    document: Document,
    is_new: bool,
    chunks: Vec<Chunk>,
}

async fn record_chunking_failure(ctx: &RunContext, document: &Document, err: ChunkingError) {
    tracing::error!(document_id = document.id, error = %err, "chunking failed");
    ctx.metrics.record_failed();
}

/// Acquire a concurrency permit and spawn one batch's embed+upsert+state
/// writes as a tracked task, so the consumer keeps accumulating the next
/// batch while up to `embed_concurrency` prior batches are still in flight.
async fn spawn_flush(
    ctx: &Arc<RunContext>,
    semaphore: &Arc<Semaphore>,
    in_flight: &mut JoinSet<()>,
    batch: Vec<PendingDocument>,
) {
    let permit = Arc::clone(semaphore).acquire_owned().await.expect("semaphore never closed");
    let ctx = Arc::clone(ctx);
    in_flight.spawn(async move {
        flush_batch(&ctx, batch).await;
        drop(permit);
    });
}

/// Embed every chunk in `batch`, upsert the resulting vectors, and (only on
/// success) write the state records — the ordering §4.8 requires so a crash
/// between upsert and state write is recoverable by re-running (idempotent
/// by `point_id`), never by silently marking an un-upserted document done.
async fn flush_batch(ctx: &RunContext, batch: Vec<PendingDocument>) {
    if batch.is_empty() {
        return;
    }

    let texts: Vec<String> = batch.iter().flat_map(|doc| doc.chunks.iter().map(|c| c.content.clone())).collect();
    let total_chunks = texts.len();
    if total_chunks == 0 {
        // Every Document in the batch chunked to nothing (e.g. blank files); there is
        // still state to record so re-runs treat them as unchanged afterwards.
        for doc in &batch {
            record_state_success(ctx, doc, 0).await;
        }
        return;
    }

    let vectors = match ctx.embedding.embed(texts, &ctx.cancel).await {
        Ok(vectors) => vectors,
        Err(err) => {
            tracing::error!(error = %err, batch_size = batch.len(), "embedding call failed; dropping batch for this run");
            for _ in &batch {
                ctx.metrics.record_failed();
            }
            return;
        }
    };

    let mut records = Vec::with_capacity(total_chunks);
    let mut vector_iter = vectors.into_iter();
    let mut chunk_counts = Vec::with_capacity(batch.len());
    for doc in &batch {
        let mut count = 0usize;
        for chunk in &doc.chunks {
            let Some(vector) = vector_iter.next() else { break };
            records.push(build_record(&ctx.project_id, doc, chunk, vector));
            count += 1;
        }
        chunk_counts.push(count);
    }

    match upsert_with_retry(&ctx.qdrant, &ctx.collection_name, &ctx.project_id, &records, ctx.qdrant_batch_size).await {
        Ok(_) => {
            for (doc, count) in batch.iter().zip(chunk_counts) {
                record_state_success(ctx, doc, count as u64).await;
            }
        }
        Err(err) => {
            tracing::error!(error = %err, batch_size = batch.len(), "qdrant upsert failed after retries; dropping batch for this run");
            for _ in &batch {
                ctx.metrics.record_failed();
            }
        }
    }
}

async fn record_state_success(ctx: &RunContext, doc: &PendingDocument, chunk_count: u64) {
    let parent_id = doc
        .document
        .metadata
        .get(crate::model::metadata_keys::ATTACHMENT_OF)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let record = StateRecord {
        project_id: ctx.project_id.clone(),
        source_type: doc.document.source_type,
        source_name: doc.document.source_name.clone(),
        document_id: doc.document.id.clone(),
        content_hash: doc.document.content_hash(),
        last_ingested_at: Utc::now(),
        parent_id,
        is_deleted: false,
    };
    if let Err(err) = ctx.state.upsert(&record).await {
        tracing::error!(document_id = doc.document.id, error = %err, "failed to write state record after successful upsert");
        ctx.metrics.record_failed();
        return;
    }
    if doc.is_new {
        ctx.metrics.record_new(chunk_count, chunk_count);
    } else {
        ctx.metrics.record_updated(chunk_count, chunk_count);
    }
}

fn build_record(project_id: &str, doc: &PendingDocument, chunk: &Chunk, vector: Vec<f32>) -> VectorRecord {
    let mut metadata = doc.document.metadata.clone();
    if let Some(section_path) = &chunk.section_path {
        metadata.insert("section_path".to_string(), serde_json::json!(section_path));
    }
    metadata.insert("chunk_total".to_string(), serde_json::json!(chunk.chunk_total));

    VectorRecord {
        point_id: point_id(project_id, chunk),
        vector,
        payload: VectorPayload {
            project_id: project_id.to_string(),
            source_type: doc.document.source_type,
            source_name: doc.document.source_name.clone(),
            document_id: doc.document.id.clone(),
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
            url: doc.document.url.clone(),
            title: doc.document.title.clone(),
            metadata,
        },
    }
}

/// Retry a batch upsert with exponential backoff, classifying 5xx/429
/// responses and transport errors as retryable (§4.8: "a batch-level QDrant
/// failure retries with backoff up to §4.3's policy; if still failing, the
/// entire batch is dropped").
async fn upsert_with_retry(
    qdrant: &QdrantService,
    collection_name: &str,
    project_id: &str,
    points: &[VectorRecord],
    batch_size: usize,
) -> Result<crate::qdrant::UpsertSummary, QdrantError> {
    const MAX_RETRIES: u32 = 5;
    let mut attempt = 0;
    loop {
        match qdrant.upsert(collection_name, project_id, points, batch_size).await {
            Ok(summary) => return Ok(summary),
            Err(err) => {
                let retryable = match &err {
                    QdrantError::Http(_) => true,
                    QdrantError::UnexpectedStatus { status, .. } => status.is_server_error() || status.as_u16() == 429,
                    QdrantError::InvalidUrl(_) => false,
                };
                if !retryable || attempt >= MAX_RETRIES {
                    return Err(err);
                }
                attempt += 1;
                let delay = full_jitter_backoff(attempt, Duration::from_millis(500), Duration::from_secs(20));
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying qdrant upsert batch");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Build a project-scoped filter with no further constraints; used by the
/// CLI's `project status` to count a project's points.
pub fn project_filter(project_id: impl Into<String>) -> SearchFilterArgs {
    SearchFilterArgs::for_project(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;

    #[test]
    fn ingest_filter_matches_everything_when_empty() {
        let filter = IngestFilter::default();
        assert!(filter.matches(SourceType::Localfile, "docs"));
        assert!(filter.matches(SourceType::Git, "other"));
    }

    #[test]
    fn ingest_filter_narrows_by_source_type() {
        let filter = IngestFilter {
            source_type: Some(SourceType::Git),
            source_name: None,
        };
        assert!(filter.matches(SourceType::Git, "docs"));
        assert!(!filter.matches(SourceType::Localfile, "docs"));
    }

    #[test]
    fn ingest_filter_narrows_by_source_name() {
        let filter = IngestFilter {
            source_type: None,
            source_name: Some("docs".to_string()),
        };
        assert!(filter.matches(SourceType::Localfile, "docs"));
        assert!(!filter.matches(SourceType::Localfile, "other"));
    }
}
