//! # Count Queue Repository
//!
//! Append-only queue of counts parked while the remote store was
//! unreachable.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Parked Count Lifecycle                               │
//! │                                                                         │
//! │  confirm()/pause() offline, shutdown                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT (uploaded = 0)  ← committed (FULL sync) before returning       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              RECONCILE TICK (oldest id first)                   │   │
//! │  │                                                                 │   │
//! │  │  upload ok     → id collected                                   │   │
//! │  │  upload failed → retry_count += 1, last_error = ?, STOP         │   │
//! │  │                                                                 │   │
//! │  │  collected ids → uploaded = 1 (one transaction)                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DELETE once uploaded_at is older than the retention window            │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • A record flips to uploaded exactly once                             │
//! │  • Upload order is id order, no skip-ahead                             │
//! │  • upload_id travels with every upload; the remote ignores repeats     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{CountRecord, NewCountRecord};

/// Timestamps are stored as fixed-width RFC 3339 text so that string
/// comparison in SQL matches time order.
fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::CorruptRow(format!("timestamp '{raw}': {e}")))
}

fn row_to_record(row: &SqliteRow) -> DbResult<CountRecord> {
    let upload_id: String = row.try_get("upload_id")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    let uploaded: i64 = row.try_get("uploaded")?;

    Ok(CountRecord {
        id: row.try_get("id")?,
        upload_id: Uuid::parse_str(&upload_id)
            .map_err(|e| DbError::CorruptRow(format!("upload_id '{upload_id}': {e}")))?,
        timestamp: decode_time(&recorded_at)?,
        count: row.try_get("count")?,
        uploaded: uploaded != 0,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
    })
}

fn ensure_positive(count: i64) -> DbResult<()> {
    if count <= 0 {
        return Err(DbError::InvalidRecord(format!(
            "count must be positive, got {count}"
        )));
    }
    Ok(())
}

const INSERT_RECORD: &str = r#"
    INSERT INTO count_queue (upload_id, recorded_at, count)
    VALUES (?1, ?2, ?3)
"#;

/// Repository for the local count queue.
#[derive(Debug, Clone)]
pub struct CountQueueRepository {
    pool: SqlitePool,
}

impl CountQueueRepository {
    /// Creates a new CountQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CountQueueRepository { pool }
    }

    /// Parks `count` parts under a fresh upload id.
    ///
    /// ## Returns
    /// The new record's id. The row is committed when this returns.
    pub async fn add_record(&self, count: i64) -> DbResult<i64> {
        let record = NewCountRecord::new(count, Utc::now());
        let ids = self.add_records(std::slice::from_ref(&record)).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| DbError::Internal("insert returned no id".to_string()))
    }

    /// Parks several batches atomically, keeping their upload ids.
    ///
    /// Either every batch is committed or none is.
    pub async fn add_records(&self, records: &[NewCountRecord]) -> DbResult<Vec<i64>> {
        for record in records {
            ensure_positive(record.count)?;
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let result = sqlx::query(INSERT_RECORD)
                .bind(record.upload_id.to_string())
                .bind(encode_time(record.timestamp))
                .bind(record.count)
                .execute(&mut *tx)
                .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;

        let total: i64 = records.iter().map(|r| r.count).sum();
        info!(records = records.len(), count = total, "Counts parked in local queue");
        Ok(ids)
    }

    /// Gets records not yet uploaded, oldest first.
    pub async fn get_pending(&self) -> DbResult<Vec<CountRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, upload_id, recorded_at, count, uploaded, retry_count, last_error
            FROM count_queue
            WHERE uploaded = 0
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Looks up a single record by id.
    pub async fn get_by_id(&self, id: i64) -> DbResult<Option<CountRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, upload_id, recorded_at, count, uploaded, retry_count, last_error
            FROM count_queue
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Marks records as accepted by the remote, in one transaction.
    ///
    /// Records already marked are left alone.
    ///
    /// ## Returns
    /// Number of records that flipped to uploaded.
    pub async fn mark_uploaded(&self, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = encode_time(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut flipped = 0;

        for &id in ids {
            let result = sqlx::query(
                r#"
                UPDATE count_queue SET
                    uploaded = 1,
                    uploaded_at = ?2
                WHERE id = ?1 AND uploaded = 0
                "#,
            )
            .bind(id)
            .bind(now.as_str())
            .execute(&mut *tx)
            .await?;
            flipped += result.rows_affected();
        }

        tx.commit().await?;

        debug!(requested = ids.len(), flipped, "Records marked uploaded");
        Ok(flipped)
    }

    /// Records a failed upload attempt.
    ///
    /// ## Returns
    /// The record's retry count after the increment.
    pub async fn increment_retry(&self, id: i64, error: &str) -> DbResult<i64> {
        let retry_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE count_queue SET
                retry_count = retry_count + 1,
                last_error = ?2
            WHERE id = ?1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        retry_count.ok_or_else(|| DbError::not_found("CountRecord", id.to_string()))
    }

    /// Sum of counts not yet uploaded (0 when the queue is empty).
    pub async fn total_pending(&self) -> DbResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(count), 0) FROM count_queue WHERE uploaded = 0",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Number of records not yet uploaded.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM count_queue WHERE uploaded = 0")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Deletes uploaded records whose upload is older than `older_than`.
    ///
    /// Records still pending are never deleted, whatever their age.
    ///
    /// ## Returns
    /// Number of deleted records.
    pub async fn prune_uploaded(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM count_queue
            WHERE uploaded = 1
            AND uploaded_at IS NOT NULL
            AND uploaded_at < ?1
            "#,
        )
        .bind(encode_time(older_than))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "Pruned uploaded records");
        }
        Ok(deleted)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
