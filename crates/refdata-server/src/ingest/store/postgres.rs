//! PostgreSQL store
//!
//! Runtime-checked sqlx queries against the tables created by
//! `migrations/20260101000001_ingestion_pipeline.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::path::PathBuf;
use uuid::Uuid;

use super::{IngestStore, StoreError, StoreResult};
use crate::ingest::models::{
    AuditEntry, BatchOutcome, FailureCategory, JobKind, JobState, JobStatus, LeiRecord,
    SnapshotFile, SnapshotProgress, StoredRecord,
};
use crate::ingest::upsert::{plan_change, RecordChange};

const SNAPSHOT_COLUMNS: &str = r#"
    id, kind, downloaded_at, source_uri, artifact_path, artifact_sha256, artifact_bytes,
    total_records, total_records_final, processed_records, failed_records,
    processing_status, checkpoint_key, retry_count, max_retries,
    failure_category, error_message, updated_at
"#;

const RECORD_COLUMNS: &str = r#"
    lei, legal_name, jurisdiction, country, entity_status, registration_status,
    last_update, last_snapshot_id, created_at, updated_at
"#;

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: Uuid,
    kind: String,
    downloaded_at: DateTime<Utc>,
    source_uri: String,
    artifact_path: String,
    artifact_sha256: Option<String>,
    artifact_bytes: i64,
    total_records: i64,
    total_records_final: bool,
    processed_records: i64,
    failed_records: i64,
    processing_status: String,
    checkpoint_key: String,
    retry_count: i32,
    max_retries: i32,
    failure_category: Option<String>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for SnapshotFile {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(SnapshotFile {
            id: row.id,
            kind: row.kind.parse().map_err(StoreError::CorruptRow)?,
            downloaded_at: row.downloaded_at,
            source_uri: row.source_uri,
            artifact_path: PathBuf::from(row.artifact_path),
            artifact_sha256: row.artifact_sha256,
            artifact_bytes: row.artifact_bytes,
            total_records: row.total_records,
            total_records_final: row.total_records_final,
            processed_records: row.processed_records,
            failed_records: row.failed_records,
            processing_status: row.processing_status.parse().map_err(StoreError::CorruptRow)?,
            checkpoint_key: row.checkpoint_key,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            failure_category: row
                .failure_category
                .map(|c| c.parse())
                .transpose()
                .map_err(StoreError::CorruptRow)?,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    kind: String,
    status: String,
    current_snapshot_id: Option<Uuid>,
    error_message: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    owner: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobStatus {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobStatus {
            kind: row.kind.parse().map_err(StoreError::CorruptRow)?,
            status: row.status.parse().map_err(StoreError::CorruptRow)?,
            current_snapshot_id: row.current_snapshot_id,
            error_message: row.error_message,
            last_success_at: row.last_success_at,
            owner: row.owner,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    lei: String,
    legal_name: String,
    jurisdiction: Option<String>,
    country: String,
    entity_status: String,
    registration_status: String,
    last_update: DateTime<Utc>,
    last_snapshot_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for StoredRecord {
    fn from(row: RecordRow) -> Self {
        StoredRecord {
            record: LeiRecord {
                lei: row.lei,
                legal_name: row.legal_name,
                jurisdiction: row.jurisdiction,
                country: row.country,
                entity_status: row.entity_status,
                registration_status: row.registration_status,
                last_update: row.last_update,
            },
            last_snapshot_id: row.last_snapshot_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    lei: String,
    snapshot_id: Uuid,
    action: String,
    previous: Option<serde_json::Value>,
    changed: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: row.id,
            lei: row.lei,
            snapshot_id: row.snapshot_id,
            action: row.action.parse().map_err(StoreError::CorruptRow)?,
            previous: row.previous,
            changed: row.changed,
            created_at: row.created_at,
        })
    }
}

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_snapshots(&self, sql: &str, kind: JobKind) -> StoreResult<Vec<SnapshotFile>> {
        sqlx::query_as::<_, SnapshotRow>(sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SnapshotFile::try_from)
            .collect()
    }

    async fn write_audit(
        tx: &mut Transaction<'_, Postgres>,
        entry: &AuditEntry,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO record_audit (id, lei, snapshot_id, action, previous, changed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.lei)
        .bind(entry.snapshot_id)
        .bind(entry.action.as_str())
        .bind(&entry.previous)
        .bind(&entry.changed)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn expect_row(rows_affected: u64, what: impl FnOnce() -> String) -> StoreResult<()> {
        if rows_affected == 0 {
            Err(StoreError::NotFound(what()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn insert_snapshot(&self, snapshot: &SnapshotFile) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshot_files (
                id, kind, downloaded_at, source_uri, artifact_path, artifact_sha256,
                artifact_bytes, total_records, total_records_final, processed_records,
                failed_records, processing_status, checkpoint_key, retry_count, max_retries,
                failure_category, error_message, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.kind.as_str())
        .bind(snapshot.downloaded_at)
        .bind(&snapshot.source_uri)
        .bind(snapshot.artifact_path.to_string_lossy().to_string())
        .bind(&snapshot.artifact_sha256)
        .bind(snapshot.artifact_bytes)
        .bind(snapshot.total_records)
        .bind(snapshot.total_records_final)
        .bind(snapshot.processed_records)
        .bind(snapshot.failed_records)
        .bind(snapshot.processing_status.as_str())
        .bind(&snapshot.checkpoint_key)
        .bind(snapshot.retry_count)
        .bind(snapshot.max_retries)
        .bind(snapshot.failure_category.map(|c| c.as_str()))
        .bind(&snapshot.error_message)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> StoreResult<Option<SnapshotFile>> {
        let sql = format!("SELECT {} FROM snapshot_files WHERE id = $1", SNAPSHOT_COLUMNS);
        sqlx::query_as::<_, SnapshotRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(SnapshotFile::try_from)
            .transpose()
    }

    async fn latest_snapshot(&self, kind: JobKind) -> StoreResult<Option<SnapshotFile>> {
        let sql = format!(
            "SELECT {} FROM snapshot_files WHERE kind = $1 ORDER BY downloaded_at DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        Ok(self.fetch_snapshots(&sql, kind).await?.into_iter().next())
    }

    async fn list_snapshots(&self, kind: JobKind) -> StoreResult<Vec<SnapshotFile>> {
        let sql = format!(
            "SELECT {} FROM snapshot_files WHERE kind = $1 ORDER BY downloaded_at DESC",
            SNAPSHOT_COLUMNS
        );
        self.fetch_snapshots(&sql, kind).await
    }

    async fn mark_snapshot_in_progress(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshot_files
            SET processing_status = 'in_progress', failure_category = NULL,
                error_message = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), || format!("snapshot {}", id))
    }

    async fn save_progress(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshot_files
            SET total_records = $2, total_records_final = $3, processed_records = $4,
                failed_records = $5, checkpoint_key = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.total_records)
        .bind(progress.total_records_final)
        .bind(progress.processed_records)
        .bind(progress.failed_records)
        .bind(&progress.checkpoint_key)
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), || format!("snapshot {}", id))
    }

    async fn complete_snapshot(&self, id: Uuid, progress: &SnapshotProgress) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshot_files
            SET total_records = $2, total_records_final = $3, processed_records = $4,
                failed_records = $5, checkpoint_key = $6,
                processing_status = 'completed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.total_records)
        .bind(progress.total_records_final)
        .bind(progress.processed_records)
        .bind(progress.failed_records)
        .bind(&progress.checkpoint_key)
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), || format!("snapshot {}", id))
    }

    async fn fail_snapshot(
        &self,
        id: Uuid,
        category: FailureCategory,
        message: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshot_files
            SET processing_status = 'failed', failure_category = $2,
                error_message = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(category.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Self::expect_row(result.rows_affected(), || format!("snapshot {}", id))
    }

    async fn increment_retry(&self, id: Uuid) -> StoreResult<i32> {
        let retry_count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE snapshot_files
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        retry_count.ok_or_else(|| StoreError::NotFound(format!("snapshot {}", id)))
    }

    async fn job_status(&self, kind: JobKind) -> StoreResult<JobStatus> {
        sqlx::query("INSERT INTO job_status (kind) VALUES ($1) ON CONFLICT (kind) DO NOTHING")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT kind, status, current_snapshot_id, error_message, last_success_at, owner,
                   updated_at
            FROM job_status
            WHERE kind = $1
            "#,
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        JobStatus::try_from(row)
    }

    async fn try_claim_job(
        &self,
        kind: JobKind,
        from: &[JobState],
        owner: &str,
    ) -> StoreResult<bool> {
        let allowed: Vec<&str> = from.iter().map(|s| s.as_str()).collect();

        // Single conditional UPDATE: the row changes only if nobody moved it
        // out of an allowed state since we last looked.
        let result = sqlx::query(
            r#"
            UPDATE job_status
            SET status = 'running', error_message = NULL, owner = $3, updated_at = NOW()
            WHERE kind = $1 AND status = ANY($2)
            "#,
        )
        .bind(kind.as_str())
        .bind(&allowed)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn attach_snapshot(&self, kind: JobKind, snapshot_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE job_status SET current_snapshot_id = $2, updated_at = NOW() WHERE kind = $1",
        )
        .bind(kind.as_str())
        .bind(snapshot_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_job(&self, kind: JobKind) -> StoreResult<()> {
        sqlx::query("UPDATE job_status SET updated_at = NOW() WHERE kind = $1 AND status = 'running'")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_job(&self, kind: JobKind) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE job_status
            SET status = 'completed', error_message = NULL,
                last_success_at = NOW(), updated_at = NOW()
            WHERE kind = $1
            "#,
        )
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, kind: JobKind, message: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE job_status
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE kind = $1
            "#,
        )
        .bind(kind.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_job(&self, kind: JobKind, message: Option<&str>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE job_status
            SET status = 'idle', error_message = $2, updated_at = NOW()
            WHERE kind = $1
            "#,
        )
        .bind(kind.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_stale_jobs(
        &self,
        before: DateTime<Utc>,
        orphaned_by: Option<&str>,
    ) -> StoreResult<Vec<JobKind>> {
        let kinds: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE job_status
            SET status = 'failed',
                error_message = 'interrupted: owner stopped before the run settled',
                updated_at = NOW()
            WHERE status = 'running' AND (updated_at < $1 OR owner = $2)
            RETURNING kind
            "#,
        )
        .bind(before)
        .bind(orphaned_by)
        .fetch_all(&self.pool)
        .await?;

        kinds
            .into_iter()
            .map(|k| k.parse().map_err(StoreError::CorruptRow))
            .collect()
    }

    async fn apply_batch(
        &self,
        snapshot_id: Uuid,
        batch: &[LeiRecord],
    ) -> StoreResult<BatchOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();
        let select = format!("SELECT {} FROM lei_records WHERE lei = $1 FOR UPDATE", RECORD_COLUMNS);

        for incoming in batch {
            let existing = sqlx::query_as::<_, RecordRow>(&select)
                .bind(&incoming.lei)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| StoredRecord::from(row).record);

            let change = plan_change(existing.as_ref(), incoming)?;
            change.tally(&mut outcome);

            match change {
                RecordChange::Create { .. } => {
                    sqlx::query(
                        r#"
                        INSERT INTO lei_records (
                            lei, legal_name, jurisdiction, country, entity_status,
                            registration_status, last_update, last_snapshot_id
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(&incoming.lei)
                    .bind(&incoming.legal_name)
                    .bind(&incoming.jurisdiction)
                    .bind(&incoming.country)
                    .bind(&incoming.entity_status)
                    .bind(&incoming.registration_status)
                    .bind(incoming.last_update)
                    .bind(snapshot_id)
                    .execute(&mut *tx)
                    .await?;
                },
                RecordChange::Update { .. } => {
                    sqlx::query(
                        r#"
                        UPDATE lei_records
                        SET legal_name = $2, jurisdiction = $3, country = $4,
                            entity_status = $5, registration_status = $6,
                            last_update = $7, last_snapshot_id = $8, updated_at = NOW()
                        WHERE lei = $1
                        "#,
                    )
                    .bind(&incoming.lei)
                    .bind(&incoming.legal_name)
                    .bind(&incoming.jurisdiction)
                    .bind(&incoming.country)
                    .bind(&incoming.entity_status)
                    .bind(&incoming.registration_status)
                    .bind(incoming.last_update)
                    .bind(snapshot_id)
                    .execute(&mut *tx)
                    .await?;
                },
                RecordChange::Unchanged | RecordChange::Stale => continue,
            }

            if let Some(entry) = change.audit_entry(&incoming.lei, snapshot_id) {
                Self::write_audit(&mut tx, &entry).await?;
            }
        }

        // Dropping the transaction on any early return above rolls it back.
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_record(&self, lei: &str) -> StoreResult<Option<StoredRecord>> {
        let sql = format!("SELECT {} FROM lei_records WHERE lei = $1", RECORD_COLUMNS);
        Ok(sqlx::query_as::<_, RecordRow>(&sql)
            .bind(lei)
            .fetch_optional(&self.pool)
            .await?
            .map(StoredRecord::from))
    }

    async fn list_records(&self, limit: i64, offset: i64) -> StoreResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {} FROM lei_records ORDER BY lei LIMIT $1 OFFSET $2",
            RECORD_COLUMNS
        );
        Ok(sqlx::query_as::<_, RecordRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredRecord::from)
            .collect())
    }

    async fn audit_history(&self, lei: &str) -> StoreResult<Vec<AuditEntry>> {
        sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, lei, snapshot_id, action, previous, changed, created_at
            FROM record_audit
            WHERE lei = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(lei)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(AuditEntry::try_from)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_row_conversion_rejects_unknown_status() {
        let row = SnapshotRow {
            id: Uuid::new_v4(),
            kind: "full".to_string(),
            downloaded_at: Utc::now(),
            source_uri: "https://example.org".to_string(),
            artifact_path: "/data/full.csv".to_string(),
            artifact_sha256: None,
            artifact_bytes: 0,
            total_records: 0,
            total_records_final: false,
            processed_records: 0,
            failed_records: 0,
            processing_status: "paused".to_string(),
            checkpoint_key: String::new(),
            retry_count: 0,
            max_retries: 3,
            failure_category: None,
            error_message: None,
            updated_at: Utc::now(),
        };

        let err = SnapshotFile::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow(_)));
    }

    #[test]
    fn test_job_row_conversion() {
        let row = JobRow {
            kind: "delta".to_string(),
            status: "failed".to_string(),
            current_snapshot_id: None,
            error_message: Some("boom".to_string()),
            last_success_at: None,
            owner: Some("node-a".to_string()),
            updated_at: Utc::now(),
        };

        let status = JobStatus::try_from(row).unwrap();
        assert_eq!(status.kind, JobKind::Delta);
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.owner.as_deref(), Some("node-a"));
    }
}
