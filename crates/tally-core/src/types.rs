//! # Domain Types
//!
//! Records, snapshots and status values shared across the workspace.
//!
//! ## Where Counts Live
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     The Four Counters                                   │
//! │                                                                         │
//! │   sensor edge                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │   live_count ──(confirm offline / pause offline)──► pending_upload     │
//! │       │                                                  │              │
//! │       │ (confirm online)                      (drain)    │              │
//! │       ▼                                                  ▼              │
//! │   last_confirmed ◄──────(confirm online)────── unconfirmed_remote      │
//! │                                                                         │
//! │   total_unconfirmed = confirmed + unconfirmed + live + pending         │
//! │   (derived on demand, never stored)                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Connection Status
// =============================================================================

/// Connectivity to the remote production store.
///
/// Written only by the connection manager; everything else reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected; remote calls may be issued.
    Connected,
    /// The last failure was not a network failure.
    Error,
}

impl ConnectionStatus {
    /// Returns true if remote calls may be issued.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Count Record (local durable queue row)
// =============================================================================

/// A batch of counts persisted locally while the remote was unreachable.
///
/// Created by the queue when live counts are parked (confirm while
/// offline, pause while offline, shutdown). Only the queue mutates a
/// record after creation: `uploaded` flips once, `retry_count` grows on
/// failed uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecord {
    /// Local row id; monotonically increasing, defines upload order.
    pub id: i64,
    /// Idempotency key sent with every upload of this record.
    pub upload_id: Uuid,
    /// When the counts were parked.
    pub timestamp: DateTime<Utc>,
    /// Number of parts in this batch (always positive).
    pub count: i64,
    /// Whether the remote has accepted this record.
    pub uploaded: bool,
    /// Failed upload attempts so far.
    pub retry_count: i64,
    /// Error text of the last failed upload.
    pub last_error: Option<String>,
}

/// A batch to be written to the local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCountRecord {
    pub upload_id: Uuid,
    pub count: i64,
    pub timestamp: DateTime<Utc>,
}

impl NewCountRecord {
    /// Creates a batch with a fresh upload id.
    pub fn new(count: i64, timestamp: DateTime<Utc>) -> Self {
        NewCountRecord {
            upload_id: Uuid::new_v4(),
            count,
            timestamp,
        }
    }
}

// =============================================================================
// Remote Counts
// =============================================================================

/// Totals read back from the remote store for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteCounts {
    /// Confirmed running total.
    pub confirmed: i64,
    /// Sum of count events logged since the last confirmation.
    pub unconfirmed: i64,
}

impl RemoteCounts {
    /// Total the remote knows about (confirmed plus logged events).
    pub fn known_total(&self) -> i64 {
        self.confirmed + self.unconfirmed
    }
}

// =============================================================================
// System State (read-only snapshot)
// =============================================================================

/// Point-in-time copy of the engine's counters.
///
/// Display and input collaborators only ever see this type. The derived
/// total is a method, not a field, so it cannot drift.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub live_count: i64,
    pub paused: bool,
    pub last_confirmed_count: i64,
    pub unconfirmed_remote_count: i64,
    pub pending_upload_count: i64,
    pub connection_status: ConnectionStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_detection_time: Option<DateTime<Utc>>,
}

impl SystemState {
    /// Confirmed + unconfirmed-remote + live + pending.
    pub fn total_unconfirmed(&self) -> i64 {
        self.last_confirmed_count
            + self.unconfirmed_remote_count
            + self.live_count
            + self.pending_upload_count
    }
}
