//! # MySQL Remote Store
//!
//! The production store shared with the plant's reporting tools.
//!
//! ## Tables
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  heading_data                 mfgreq_data                               │
//! │  ─────────────                ───────────                               │
//! │  headName  ──┐                reqLot ◄──── reqID                        │
//! │  reqID    ───┼──────────────► reqCount   (confirmed total)              │
//! │  lastCountUpdate (window start)                                         │
//! │  headStatus      ACTIVE / INACTIVE                                      │
//! │              │                                                          │
//! │  heading_rates (event log)                                              │
//! │  ─────────────                                                          │
//! │  headName, studCount, updateFullDate, updateDate, updateHour,           │
//! │  updateMinute, uploadId (UNIQUE)                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unconfirmed = `SUM(studCount)` of events with
//! `updateFullDate >= lastCountUpdate`. DATETIME has one-second
//! precision, so both writes keep the window boundary exact:
//! - an event is stamped no earlier than the current `lastCountUpdate`
//! - a confirmation moves `lastCountUpdate` one second past every event
//!   already logged for the line

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{CountUpload, RemoteStore};
use crate::error::{SyncError, SyncResult};
use tally_core::RemoteCounts;

/// Current local time truncated to whole seconds (DATETIME precision).
fn now_seconds() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Remote store backed by a MySQL connection pool.
#[derive(Debug)]
pub struct MySqlRemote {
    url: String,
    connect_timeout: Duration,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlRemote {
    /// Creates an unconnected store for `url` (`mysql://...`).
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        MySqlRemote {
            url: url.into(),
            connect_timeout,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> SyncResult<MySqlPool> {
        self.pool.read().await.clone().ok_or(SyncError::NotConnected)
    }
}

impl RemoteStore for MySqlRemote {
    async fn connect(&self) -> SyncResult<()> {
        let existing = self.pool.read().await.clone();
        if let Some(pool) = existing {
            // A pool outlives its sockets; only a round trip proves the link.
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    debug!(error = %err, "Existing remote pool is stale, reopening");
                    self.disconnect().await;
                }
            }
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| SyncError::RemoteConnect(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| SyncError::RemoteConnect(e.to_string()))?;

        *self.pool.write().await = Some(pool);
        info!("Connected to remote store");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            debug!("Remote pool closed");
        }
    }

    async fn get_current_counts(&self, head_name: &str) -> SyncResult<RemoteCounts> {
        let pool = self.pool().await?;

        let line: Option<(Option<i64>, Option<NaiveDateTime>)> = sqlx::query_as(
            r#"
            SELECT CAST(mfg.reqCount AS SIGNED), hea.lastCountUpdate
            FROM heading_data hea
            LEFT JOIN mfgreq_data mfg ON hea.reqID = mfg.reqLot
            WHERE hea.headName = ?
            LIMIT 1
            "#,
        )
        .bind(head_name)
        .fetch_optional(&pool)
        .await
        .map_err(SyncError::query)?;

        let Some((confirmed, last_update)) = line else {
            warn!(head = %head_name, "Line not found in heading_data, reporting zero counts");
            return Ok(RemoteCounts::default());
        };

        let unconfirmed: i64 = match last_update {
            Some(since) => sqlx::query_scalar::<_, i64>(
                r#"
                SELECT CAST(COALESCE(SUM(studCount), 0) AS SIGNED)
                FROM heading_rates
                WHERE headName = ? AND updateFullDate >= ?
                "#,
            )
            .bind(head_name)
            .bind(since),
            // Never confirmed: every logged event is unconfirmed
            None => sqlx::query_scalar::<_, i64>(
                r#"
                SELECT CAST(COALESCE(SUM(studCount), 0) AS SIGNED)
                FROM heading_rates
                WHERE headName = ?
                "#,
            )
            .bind(head_name),
        }
        .fetch_one(&pool)
        .await
        .map_err(SyncError::query)?;

        Ok(RemoteCounts {
            confirmed: confirmed.unwrap_or(0),
            unconfirmed,
        })
    }

    async fn upload_count_record(&self, head_name: &str, upload: &CountUpload) -> SyncResult<()> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(SyncError::write)?;

        let window_start: Option<NaiveDateTime> = sqlx::query_scalar(
            "SELECT lastCountUpdate FROM heading_data WHERE headName = ? LIMIT 1",
        )
        .bind(head_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SyncError::write)?
        .flatten();

        // Stamped on arrival: a batch parked for hours still lands inside
        // the current unconfirmed window.
        let stamp = window_start.map_or(now_seconds(), |start| start.max(now_seconds()));

        let result = sqlx::query(
            r#"
            INSERT IGNORE INTO heading_rates
                (headName, studCount, updateFullDate, updateDate, updateHour, updateMinute, uploadId)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(head_name)
        .bind(upload.count)
        .bind(stamp)
        .bind(stamp.format("%m/%d/%y").to_string())
        .bind(stamp.hour())
        .bind(stamp.minute())
        .bind(upload.upload_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(SyncError::write)?;

        tx.commit().await.map_err(SyncError::write)?;

        if result.rows_affected() == 0 {
            debug!(upload_id = %upload.upload_id, "Upload already logged, ignored");
        } else {
            debug!(
                upload_id = %upload.upload_id,
                count = upload.count,
                recorded_at = %upload.recorded_at,
                "Count uploaded"
            );
        }
        Ok(())
    }

    async fn confirm_counts(&self, head_name: &str, new_total: i64) -> SyncResult<()> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(SyncError::write)?;

        let latest_event: Option<NaiveDateTime> = sqlx::query_scalar(
            "SELECT MAX(updateFullDate) FROM heading_rates WHERE headName = ?",
        )
        .bind(head_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(SyncError::write)?;

        let window_start = latest_event
            .map_or(now_seconds(), |latest| latest.max(now_seconds()))
            + ChronoDuration::seconds(1);
        let status = if new_total > 0 { "ACTIVE" } else { "INACTIVE" };

        let result = sqlx::query(
            r#"
            UPDATE heading_data hea
            JOIN mfgreq_data mfg ON hea.reqID = mfg.reqLot
            SET mfg.reqCount = ?, hea.lastCountUpdate = ?, hea.headStatus = ?
            WHERE hea.headName = ?
            "#,
        )
        .bind(new_total)
        .bind(window_start)
        .bind(status)
        .bind(head_name)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::write)?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            return Err(SyncError::UnknownHead(head_name.to_string()));
        }

        tx.commit().await.map_err(SyncError::write)?;

        info!(head = %head_name, new_total, status, "Remote confirmed total updated");
        Ok(())
    }
}
