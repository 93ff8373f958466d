//! # Reconciliation
//!
//! The periodic tick that brings the device and the remote store back in
//! line, plus the queue drain it shares with the confirm workflow.
//!
//! ## One Tick
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Reconcile tick (holds the engine gate)                 │
//! │                                                                         │
//! │  0. earlier local persist failed? ──► park live counts again            │
//! │                                                                         │
//! │  1. not connected?                                                      │
//! │       backoff not elapsed and not forced ──► done (offline)             │
//! │       connect fails ──────────────────────► done (offline)              │
//! │                                                                         │
//! │  2. get_current_counts ──► confirmed, unconfirmed                       │
//! │                                                                         │
//! │  3. drain queue, oldest id first                                        │
//! │       ok    → collect id                                                │
//! │       fail  → retry_count += 1, STOP (no skip-ahead)                    │
//! │     collected ids → uploaded (one transaction)                          │
//! │     their counts  → pending ──► unconfirmed                             │
//! │                                                                         │
//! │  4. pending = queue sum, last_sync = now, prune old uploads             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::confirm::park_live;
use crate::connection::ConnectionManager;
use crate::engine::EngineContext;
use crate::error::{SyncError, SyncResult};
use crate::remote::{bounded, CountUpload, RemoteStore};

/// Result of draining the local queue.
#[derive(Debug, Default)]
pub(crate) struct DrainReport {
    /// Records accepted by the remote and marked uploaded.
    pub records: usize,
    /// Sum of their counts.
    pub count: i64,
    /// The failure that stopped the drain, if any.
    pub failure: Option<SyncError>,
}

/// Summary of one reconcile tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether the remote store was reachable for this tick.
    pub online: bool,
    /// Queue records uploaded during this tick.
    pub uploaded_records: usize,
    /// Counts in those records.
    pub uploaded_count: i64,
    /// Counts still waiting in the queue.
    pub pending: i64,
}

/// Uploads queued records oldest-first until one fails.
///
/// Records are only marked uploaded after the remote accepted them; if
/// marking fails they are sent again next time under the same upload id.
pub(crate) async fn drain_queue<R: RemoteStore>(
    ctx: &EngineContext<R>,
    conn: &mut ConnectionManager,
) -> SyncResult<DrainReport> {
    let pending = ctx.queue.get_pending().await?;
    if pending.is_empty() {
        return Ok(DrainReport::default());
    }

    debug!(records = pending.len(), "Draining local queue");

    let mut uploaded_ids = Vec::with_capacity(pending.len());
    let mut report = DrainReport::default();
    let mut failed = None;

    for record in &pending {
        let upload = CountUpload::from(record);
        let call = ctx.remote.upload_count_record(&ctx.head_name, &upload);
        match bounded("upload", ctx.query_timeout, call).await {
            Ok(()) => {
                uploaded_ids.push(record.id);
                report.count += record.count;
            }
            Err(err) => {
                failed = Some((record.id, err));
                break;
            }
        }
    }

    if !uploaded_ids.is_empty() {
        ctx.queue.mark_uploaded(&uploaded_ids).await?;
        report.records = uploaded_ids.len();
        ctx.counts.write().await.record_drained(report.count);
        info!(
            records = report.records,
            count = report.count,
            "Queued counts uploaded"
        );
    }

    if let Some((id, err)) = failed {
        let retries = ctx.queue.increment_retry(id, &err.to_string()).await?;
        if retries >= ctx.retry_warn_threshold {
            warn!(record = id, retries, error = %err, "Queued record keeps failing to upload");
        } else {
            debug!(record = id, retries, error = %err, "Queued record upload failed");
        }
        if err.is_connection_loss() {
            conn.link_lost(&ctx.remote, &err).await;
        }
        report.failure = Some(err);
    }

    Ok(report)
}

/// Runs one reconcile tick.
///
/// `force` skips the backoff wait (operator-requested sync).
pub(crate) async fn run_tick<R: RemoteStore>(
    ctx: &EngineContext<R>,
    force: bool,
) -> SyncResult<TickReport> {
    let mut conn = ctx.gate.lock().await;

    // 0. A parked-count write that failed earlier goes first.
    if ctx.counts.read().await.persist_retry_requested() {
        let live = ctx.counts.read().await.live_count();
        match park_live(ctx, live).await {
            Ok(pending) => info!(count = live, pending, "Deferred local persist completed"),
            Err(err) => warn!(error = %err, "Local persist still failing"),
        }
    }

    // 1. Connectivity
    if !conn.is_connected() {
        if !force && !conn.attempt_due() {
            debug!("Offline, waiting for reconnect backoff");
            return Ok(offline_report(ctx).await);
        }
        conn.connect(&ctx.remote).await?;
    }

    // 2. Refresh from the remote
    let call = ctx.remote.get_current_counts(&ctx.head_name);
    let counts = match bounded("read", ctx.query_timeout, call).await {
        Ok(counts) => counts,
        Err(err) => {
            conn.link_lost(&ctx.remote, &err).await;
            return Err(err);
        }
    };
    ctx.counts.write().await.apply_remote_counts(counts);

    // 3. Drain
    let drained = drain_queue(ctx, &mut conn).await?;

    // 4. Bookkeeping
    let pending = ctx.queue.total_pending().await?;
    {
        let mut counts = ctx.counts.write().await;
        counts.set_pending(pending);
        if drained.failure.is_none() {
            counts.mark_synced(Utc::now());
        }
    }
    prune(ctx).await;

    if let Some(err) = drained.failure {
        return Err(err);
    }

    Ok(TickReport {
        online: true,
        uploaded_records: drained.records,
        uploaded_count: drained.count,
        pending,
    })
}

async fn offline_report<R: RemoteStore>(ctx: &EngineContext<R>) -> TickReport {
    TickReport {
        online: false,
        pending: ctx.counts.read().await.pending_upload_count(),
        ..Default::default()
    }
}

async fn prune<R: RemoteStore>(ctx: &EngineContext<R>) {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(ctx.retention_days));
    if let Err(err) = ctx.queue.prune_uploaded(cutoff).await {
        warn!(error = %err, "Failed to prune uploaded records");
    }
}
