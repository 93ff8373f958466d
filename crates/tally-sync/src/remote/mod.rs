//! # Remote Production Store
//!
//! The [`RemoteStore`] trait and its implementations.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RemoteStore calls                                │
//! │                                                                         │
//! │  connect() / disconnect()                                              │
//! │                                                                         │
//! │  get_current_counts(head)  → { confirmed, unconfirmed }                │
//! │       confirmed   = the line's confirmed running total                 │
//! │       unconfirmed = sum of events logged since the last confirmation   │
//! │                                                                         │
//! │  upload_count_record(head, { upload_id, count, recorded_at })          │
//! │       appends one event; a repeated upload_id is ignored               │
//! │                                                                         │
//! │  confirm_counts(head, new_total)                                       │
//! │       confirmed total, last-update time and running status in ONE      │
//! │       transaction; later events start a new unconfirmed window         │
//! │                                                                         │
//! │  Each call is one remote transaction: it lands completely or not at    │
//! │  all. The engine bounds every call with a timeout.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use tally_core::{CountRecord, RemoteCounts, StagedUpload};

pub mod memory;
pub mod mysql;

pub use memory::MemoryRemote;
pub use mysql::MySqlRemote;

/// One batch of counts sent to the remote event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountUpload {
    /// Idempotency key; the remote ignores a second upload with this id.
    pub upload_id: Uuid,
    pub count: i64,
    /// When the counts were taken on the device.
    pub recorded_at: DateTime<Utc>,
}

impl From<&CountRecord> for CountUpload {
    fn from(record: &CountRecord) -> Self {
        CountUpload {
            upload_id: record.upload_id,
            count: record.count,
            recorded_at: record.timestamp,
        }
    }
}

impl From<&StagedUpload> for CountUpload {
    fn from(staged: &StagedUpload) -> Self {
        CountUpload {
            upload_id: staged.upload_id,
            count: staged.count,
            recorded_at: staged.timestamp,
        }
    }
}

/// Read/write access to the remote production store.
///
/// Implementations hold their own connection; the engine serialises all
/// calls, so no call overlaps another on the same store.
pub trait RemoteStore: Send + Sync + 'static {
    /// Establishes the connection (idempotent).
    fn connect(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Drops the connection. Never fails.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Reads the confirmed total and the events logged since.
    fn get_current_counts(
        &self,
        head_name: &str,
    ) -> impl Future<Output = SyncResult<RemoteCounts>> + Send;

    /// Appends one count event to the remote log.
    fn upload_count_record(
        &self,
        head_name: &str,
        upload: &CountUpload,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Sets the confirmed total for the line.
    fn confirm_counts(
        &self,
        head_name: &str,
        new_total: i64,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Runs a remote call with an upper bound on its duration.
///
/// A call that does not finish in time becomes [`SyncError::Timeout`],
/// which the connection manager treats as a lost connection.
pub async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation,
            secs: limit.as_secs(),
        }),
    }
}
