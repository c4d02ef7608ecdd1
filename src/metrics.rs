//! Lock-free ingestion counters accumulated during one orchestrator run (§3).
//!
//! Mirrors the counter-then-snapshot shape used elsewhere in this codebase:
//! atomics so every pipeline stage can record concurrently without a lock,
//! and a plain-data snapshot (here, `crate::model::IngestionRun`) for the CLI
//! summary and `project status` reporting.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::IngestionRun;

/// Thread-safe counters for a single `ingest` invocation.
#[derive(Default)]
pub struct RunMetrics {
    documents_seen: AtomicU64,
    documents_new: AtomicU64,
    documents_updated: AtomicU64,
    documents_unchanged: AtomicU64,
    documents_failed: AtomicU64,
    chunks_written: AtomicU64,
    embeddings_made: AtomicU64,
    sources_failed: Mutex<Vec<(String, String)>>,
}

impl RunMetrics {
    /// Create an empty counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_seen(&self) {
        self.documents_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self, chunks: u64, embeddings: u64) {
        self.documents_new.fetch_add(1, Ordering::Relaxed);
        self.chunks_written.fetch_add(chunks, Ordering::Relaxed);
        self.embeddings_made.fetch_add(embeddings, Ordering::Relaxed);
    }

    pub fn record_updated(&self, chunks: u64, embeddings: u64) {
        self.documents_updated.fetch_add(1, Ordering::Relaxed);
        self.chunks_written.fetch_add(chunks, Ordering::Relaxed);
        self.embeddings_made.fetch_add(embeddings, Ordering::Relaxed);
    }

    pub fn record_unchanged(&self) {
        self.documents_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark `(source_type, source_name)` as having hit a fatal per-source
    /// error during this run (§7: Auth or unreachable).
    pub fn record_source_failed(&self, source_type: &str, source_name: &str) {
        let mut guard = self.sources_failed.lock().expect("sources_failed poisoned");
        let entry = (source_type.to_string(), source_name.to_string());
        if !guard.contains(&entry) {
            guard.push(entry);
        }
    }

    /// Whether zero documents succeeded and at least one source failed —
    /// the condition under which `ingest` exits non-zero (§6).
    pub fn is_total_failure(&self) -> bool {
        let succeeded = self.documents_new.load(Ordering::Relaxed)
            + self.documents_updated.load(Ordering::Relaxed)
            + self.documents_unchanged.load(Ordering::Relaxed);
        succeeded == 0
            && !self
                .sources_failed
                .lock()
                .expect("sources_failed poisoned")
                .is_empty()
    }

    /// Freeze the current counter values into a reportable snapshot.
    pub fn snapshot(&self, run_id: String) -> IngestionRun {
        IngestionRun {
            run_id,
            started_at: None,
            finished_at: None,
            documents_seen: self.documents_seen.load(Ordering::Relaxed),
            documents_new: self.documents_new.load(Ordering::Relaxed),
            documents_updated: self.documents_updated.load(Ordering::Relaxed),
            documents_unchanged: self.documents_unchanged.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            embeddings_made: self.embeddings_made.load(Ordering::Relaxed),
            sources_failed: self
                .sources_failed
                .lock()
                .expect("sources_failed poisoned")
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_across_stages() {
        let metrics = RunMetrics::new();
        metrics.record_seen();
        metrics.record_seen();
        metrics.record_new(3, 3);
        metrics.record_unchanged();

        let snapshot = metrics.snapshot("run-1".into());
        assert_eq!(snapshot.documents_seen, 2);
        assert_eq!(snapshot.documents_new, 1);
        assert_eq!(snapshot.documents_unchanged, 1);
        assert_eq!(snapshot.chunks_written, 3);
    }

    #[test]
    fn total_failure_requires_zero_successes_and_a_failed_source() {
        let metrics = RunMetrics::new();
        assert!(!metrics.is_total_failure());

        metrics.record_source_failed("git", "B");
        assert!(metrics.is_total_failure());

        metrics.record_new(1, 1);
        assert!(!metrics.is_total_failure());
    }

    #[test]
    fn source_failures_are_deduplicated() {
        let metrics = RunMetrics::new();
        metrics.record_source_failed("git", "B");
        metrics.record_source_failed("git", "B");
        let snapshot = metrics.snapshot("run-1".into());
        assert_eq!(snapshot.sources_failed.len(), 1);
    }
}
