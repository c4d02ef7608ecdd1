//! Embedded state store: one SQLite file tracking what has been ingested (§4.2).
//!
//! Grounded on `context-harness/src/db.rs` (WAL-mode `SqlitePool` via
//! `SqliteConnectOptions`) and `context-harness/src/migrate.rs` (idempotent
//! `CREATE TABLE IF NOT EXISTS` migrations run at startup), generalized from
//! a single-writer FTS index to the `StateRecord`/schema-version shape this
//! system needs.

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::model::{SourceType, StateKey, StateRecord};

/// Current schema version. Bump when `run_migrations` adds a breaking change
/// and extend the match in `check_schema_version` to migrate forward.
const SCHEMA_VERSION: i64 = 1;

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The underlying SQLite database reported an error.
    #[error("state store I/O error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// The database file's schema version doesn't match what this build expects.
    #[error("state store at unsupported schema version {found}, expected {expected}")]
    UnsupportedSchemaVersion {
        /// Schema version found on disk.
        found: i64,
        /// Schema version this build expects.
        expected: i64,
    },
}

impl From<StateStoreError> for crate::error::ErrorKind {
    fn from(e: StateStoreError) -> Self {
        crate::error::ErrorKind::State(e.to_string())
    }
}

/// Handle to the SQLite-backed state store. Cheap to clone (wraps a pool).
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if necessary) the database at `path`, run migrations,
    /// and verify the schema version.
    pub async fn open(path: &Path) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StateStoreError::Sqlx(sqlx::Error::Io(e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        store.check_schema_version().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_none() {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                project_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                document_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                last_ingested_at TEXT NOT NULL,
                parent_id TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project_id, source_type, source_name, document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_state_records_source \
             ON state_records(project_id, source_type, source_name)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                documents_seen INTEGER NOT NULL DEFAULT 0,
                documents_new INTEGER NOT NULL DEFAULT 0,
                documents_updated INTEGER NOT NULL DEFAULT 0,
                documents_unchanged INTEGER NOT NULL DEFAULT 0,
                documents_failed INTEGER NOT NULL DEFAULT 0,
                chunks_written INTEGER NOT NULL DEFAULT 0,
                embeddings_made INTEGER NOT NULL DEFAULT 0,
                sources_failed_json TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn check_schema_version(&self) -> Result<(), StateStoreError> {
        let found: i64 = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_one(&self.pool)
            .await?;
        if found != SCHEMA_VERSION {
            return Err(StateStoreError::UnsupportedSchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Fetch the current record for a document, if one exists.
    pub async fn get(&self, key: &StateKey) -> Result<Option<StateRecord>, StateStoreError> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT project_id, source_type, source_name, document_id, content_hash, \
             last_ingested_at, parent_id, is_deleted \
             FROM state_records \
             WHERE project_id = ? AND source_type = ? AND source_name = ? AND document_id = ?",
        )
        .bind(&key.project_id)
        .bind(key.source_type.as_str())
        .bind(&key.source_name)
        .bind(&key.document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StateRow::into_record))
    }

    /// All non-deleted document ids known for a given `(project, source_type,
    /// source_name)`, used by the orchestrator's orphan sweep (§4.8).
    pub async fn known_document_ids(
        &self,
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
    ) -> Result<Vec<String>, StateStoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_id FROM state_records \
             WHERE project_id = ? AND source_type = ? AND source_name = ? AND is_deleted = 0",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(source_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Insert or overwrite a `StateRecord` (upsert keyed on the composite key).
    pub async fn upsert(&self, record: &StateRecord) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            INSERT INTO state_records
                (project_id, source_type, source_name, document_id, content_hash,
                 last_ingested_at, parent_id, is_deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, source_type, source_name, document_id)
            DO UPDATE SET
                content_hash = excluded.content_hash,
                last_ingested_at = excluded.last_ingested_at,
                parent_id = excluded.parent_id,
                is_deleted = excluded.is_deleted
            "#,
        )
        .bind(&record.project_id)
        .bind(record.source_type.as_str())
        .bind(&record.source_name)
        .bind(&record.document_id)
        .bind(&record.content_hash)
        .bind(record.last_ingested_at.to_rfc3339())
        .bind(&record.parent_id)
        .bind(record.is_deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a document as deleted without removing its history row, so a
    /// future re-creation of the same id is still distinguishable as an
    /// update rather than a brand-new document.
    pub async fn mark_deleted(&self, key: &StateKey) -> Result<(), StateStoreError> {
        sqlx::query(
            "UPDATE state_records SET is_deleted = 1, last_ingested_at = ? \
             WHERE project_id = ? AND source_type = ? AND source_name = ? AND document_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&key.project_id)
        .bind(key.source_type.as_str())
        .bind(&key.source_name)
        .bind(&key.document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a completed (or in-flight) `IngestionRun` snapshot.
    pub async fn record_run(&self, run: &crate::model::IngestionRun) -> Result<(), StateStoreError> {
        let sources_failed_json = serde_json::to_string(&run.sources_failed)
            .unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs
                (run_id, started_at, finished_at, documents_seen, documents_new,
                 documents_updated, documents_unchanged, documents_failed,
                 chunks_written, embeddings_made, sources_failed_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                finished_at = excluded.finished_at,
                documents_seen = excluded.documents_seen,
                documents_new = excluded.documents_new,
                documents_updated = excluded.documents_updated,
                documents_unchanged = excluded.documents_unchanged,
                documents_failed = excluded.documents_failed,
                chunks_written = excluded.chunks_written,
                embeddings_made = excluded.embeddings_made,
                sources_failed_json = excluded.sources_failed_json
            "#,
        )
        .bind(&run.run_id)
        .bind(run.started_at.unwrap_or_else(Utc::now).to_rfc3339())
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .bind(run.documents_seen as i64)
        .bind(run.documents_new as i64)
        .bind(run.documents_updated as i64)
        .bind(run.documents_unchanged as i64)
        .bind(run.documents_failed as i64)
        .bind(run.chunks_written as i64)
        .bind(run.embeddings_made as i64)
        .bind(sources_failed_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    project_id: String,
    source_type: String,
    source_name: String,
    document_id: String,
    content_hash: String,
    last_ingested_at: String,
    parent_id: Option<String>,
    is_deleted: bool,
}

impl StateRow {
    fn into_record(self) -> StateRecord {
        let source_type = match self.source_type.as_str() {
            "git" => SourceType::Git,
            "confluence" => SourceType::Confluence,
            "jira" => SourceType::Jira,
            "publicdocs" => SourceType::Publicdocs,
            _ => SourceType::Localfile,
        };
        StateRecord {
            project_id: self.project_id,
            source_type,
            source_name: self.source_name,
            document_id: self.document_id,
            content_hash: self.content_hash,
            last_ingested_at: chrono::DateTime::parse_from_rfc3339(&self.last_ingested_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            parent_id: self.parent_id,
            is_deleted: self.is_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_test_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = StateStore::open(&path).await.unwrap();
        (store, dir)
    }

    fn sample_record() -> StateRecord {
        StateRecord {
            project_id: "p".into(),
            source_type: SourceType::Localfile,
            source_name: "A".into(),
            document_id: "doc-1".into(),
            content_hash: "hash-1".into(),
            last_ingested_at: Utc::now(),
            parent_id: None,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let (store, _dir) = open_test_store().await;
        let record = sample_record();
        store.upsert(&record).await.unwrap();

        let fetched = store.get(&record.key()).await.unwrap().expect("present");
        assert_eq!(fetched.content_hash, "hash-1");
        assert!(!fetched.is_deleted);
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_row() {
        let (store, _dir) = open_test_store().await;
        let mut record = sample_record();
        store.upsert(&record).await.unwrap();
        record.content_hash = "hash-2".into();
        store.upsert(&record).await.unwrap();

        let fetched = store.get(&record.key()).await.unwrap().unwrap();
        assert_eq!(fetched.content_hash, "hash-2");
    }

    #[tokio::test]
    async fn mark_deleted_flips_flag_without_removing_row() {
        let (store, _dir) = open_test_store().await;
        let record = sample_record();
        store.upsert(&record).await.unwrap();
        store.mark_deleted(&record.key()).await.unwrap();

        let fetched = store.get(&record.key()).await.unwrap().unwrap();
        assert!(fetched.is_deleted);
    }

    #[tokio::test]
    async fn known_document_ids_excludes_deleted() {
        let (store, _dir) = open_test_store().await;
        let mut record = sample_record();
        store.upsert(&record).await.unwrap();
        record.document_id = "doc-2".into();
        store.upsert(&record).await.unwrap();
        store.mark_deleted(&record.key()).await.unwrap();

        let ids = store
            .known_document_ids("p", SourceType::Localfile, "A")
            .await
            .unwrap();
        assert_eq!(ids, vec!["doc-1".to_string()]);
    }
}
