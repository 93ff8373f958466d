//! # Count State
//!
//! The single owner of every counter on the device.
//!
//! ## Staged Confirmations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Why a confirmation attempt is remembered                   │
//! │                                                                         │
//! │  confirm() #1                                                           │
//! │    upload live=3  (upload_id A) ──► remote logs +3        ✓ landed     │
//! │    confirm_counts(105)          ──► network drops         ✗            │
//! │    local counters untouched, staged = [A:3 landed]                     │
//! │                                                                         │
//! │  reconcile tick                                                         │
//! │    remote says unconfirmed = 2 + 3                                     │
//! │    local unconfirmed = 5 - landed(3) = 2   (live still shows the 3)    │
//! │                                                                         │
//! │  confirm() #2                                                           │
//! │    re-send A:3 (remote ignores duplicate id)                           │
//! │    confirm_counts(105)          ──► ok                                  │
//! │    staged cleared                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{ConnectionStatus, NewCountRecord, RemoteCounts, SystemState};

/// One upload made on behalf of a confirmation that has not completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpload {
    pub upload_id: Uuid,
    pub count: i64,
    pub timestamp: DateTime<Utc>,
    /// True once the remote acknowledged this upload.
    pub landed: bool,
}

/// In-memory counters for one production line.
///
/// All mutation goes through methods on this type; callers hold it behind
/// a lock and take [`snapshot`](CountState::snapshot)s for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountState {
    live_count: i64,
    paused: bool,
    last_confirmed_count: i64,
    unconfirmed_remote_count: i64,
    pending_upload_count: i64,
    last_sync_time: Option<DateTime<Utc>>,
    last_detection_time: Option<DateTime<Utc>>,
    staged: Vec<StagedUpload>,
    persist_retry: bool,
}

impl CountState {
    /// Creates a state with every counter at zero, counting active.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Counting
    // =========================================================================

    /// Registers one detection. Returns false if counting is paused.
    pub fn on_event(&mut self, at: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        self.live_count += 1;
        self.last_detection_time = Some(at);
        true
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Zeroes the live count and returns how many counts were discarded.
    ///
    /// Confirmed, unconfirmed and pending counters are left alone. Any
    /// staged confirmation is forgotten; uploads that already landed stay
    /// on the remote and show up as unconfirmed after the next refresh.
    pub fn reset(&mut self) -> i64 {
        let discarded = self.live_count;
        self.live_count = 0;
        self.staged.clear();
        discarded
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn live_count(&self) -> i64 {
        self.live_count
    }

    pub fn last_confirmed_count(&self) -> i64 {
        self.last_confirmed_count
    }

    pub fn unconfirmed_remote_count(&self) -> i64 {
        self.unconfirmed_remote_count
    }

    pub fn pending_upload_count(&self) -> i64 {
        self.pending_upload_count
    }

    /// Confirmed + unconfirmed-remote + live + pending.
    pub fn total_unconfirmed(&self) -> i64 {
        self.last_confirmed_count
            + self.unconfirmed_remote_count
            + self.live_count
            + self.pending_upload_count
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Applies totals read from the remote store.
    ///
    /// Staged uploads that already landed are part of the remote's
    /// unconfirmed sum but are still shown as live here, so they are
    /// subtracted to avoid counting them twice.
    pub fn apply_remote_counts(&mut self, counts: RemoteCounts) {
        self.last_confirmed_count = counts.confirmed;
        self.unconfirmed_remote_count = (counts.unconfirmed - self.staged_landed_total()).max(0);
    }

    /// Moves counts that were just uploaded from pending to unconfirmed.
    pub fn record_drained(&mut self, count: i64) {
        self.unconfirmed_remote_count += count;
        self.pending_upload_count = (self.pending_upload_count - count).max(0);
    }

    /// Sets the pending counter from the queue's authoritative sum.
    pub fn set_pending(&mut self, pending: i64) {
        self.pending_upload_count = pending;
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_sync_time = Some(at);
    }

    // =========================================================================
    // Confirmation
    // =========================================================================

    /// Prepares the uploads for a confirmation of `live` counts.
    ///
    /// Staged uploads from an earlier failed attempt are kept (same upload
    /// ids) and a new one is added for counts that arrived since. Returns
    /// the uploads that still need to be sent.
    pub fn stage_confirmation(&mut self, live: i64, at: DateTime<Utc>) -> Vec<StagedUpload> {
        let staged_total: i64 = self.staged.iter().map(|u| u.count).sum();
        if live > staged_total {
            self.staged.push(StagedUpload {
                upload_id: Uuid::new_v4(),
                count: live - staged_total,
                timestamp: at,
                landed: false,
            });
        }
        self.staged.iter().filter(|u| !u.landed).cloned().collect()
    }

    /// Records that the remote acknowledged a staged upload.
    pub fn mark_staged_landed(&mut self, upload_id: Uuid) {
        if let Some(upload) = self.staged.iter_mut().find(|u| u.upload_id == upload_id) {
            upload.landed = true;
        }
    }

    /// Sum of staged uploads the remote already holds.
    pub fn staged_landed_total(&self) -> i64 {
        self.staged.iter().filter(|u| u.landed).map(|u| u.count).sum()
    }

    /// Returns true if a confirmation attempt is in progress or failed.
    pub fn has_staged_confirmation(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Builds the local queue batches that park `live` counts.
    ///
    /// Landed uploads are already remote and are skipped. Staged uploads
    /// with an unknown outcome keep their upload id, so a late duplicate
    /// on the remote is ignored.
    pub fn park_batches(&self, live: i64, at: DateTime<Utc>) -> Vec<NewCountRecord> {
        let mut batches: Vec<NewCountRecord> = self
            .staged
            .iter()
            .filter(|u| !u.landed)
            .map(|u| NewCountRecord {
                upload_id: u.upload_id,
                count: u.count,
                timestamp: u.timestamp,
            })
            .collect();

        let staged_total: i64 = self.staged.iter().map(|u| u.count).sum();
        if live > staged_total {
            batches.push(NewCountRecord::new(live - staged_total, at));
        }
        batches
    }

    /// Applies a successful online confirmation.
    ///
    /// `confirmed_live` is the live count the confirmation covered; counts
    /// that arrived while the remote calls were in flight stay live.
    pub fn settle_confirmed(&mut self, new_total: i64, confirmed_live: i64) {
        self.live_count = (self.live_count - confirmed_live).max(0);
        self.last_confirmed_count = new_total;
        self.unconfirmed_remote_count = 0;
        self.pending_upload_count = 0;
        self.staged.clear();
    }

    /// Applies a successful park of `parked_live` counts into the queue.
    pub fn settle_queued(&mut self, parked_live: i64, pending: i64) {
        self.live_count = (self.live_count - parked_live).max(0);
        self.unconfirmed_remote_count += self.staged_landed_total();
        self.pending_upload_count = pending;
        self.staged.clear();
        self.persist_retry = false;
    }

    /// Flags that parking live counts failed and must be retried.
    pub fn request_persist_retry(&mut self) {
        self.persist_retry = true;
    }

    pub fn persist_retry_requested(&self) -> bool {
        self.persist_retry
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    /// Copies the counters for a read-only consumer.
    pub fn snapshot(&self, connection_status: ConnectionStatus) -> SystemState {
        SystemState {
            live_count: self.live_count,
            paused: self.paused,
            last_confirmed_count: self.last_confirmed_count,
            unconfirmed_remote_count: self.unconfirmed_remote_count,
            pending_upload_count: self.pending_upload_count,
            connection_status,
            last_sync_time: self.last_sync_time,
            last_detection_time: self.last_detection_time,
        }
    }
}
