//! # Confirmation Workflow
//!
//! Operator-triggered: folds the live count into the line's confirmed
//! total, or parks it in the local queue when the remote is unreachable.
//!
//! ## Online Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  confirm() while connected (holds the engine gate throughout)           │
//! │                                                                         │
//! │  a. drain local queue            any failure ──► Err, nothing changed   │
//! │  b. stage + upload live count    upload_id kept across attempts         │
//! │  c. get_current_counts           new_total = confirmed + unconfirmed    │
//! │                                              + pending                  │
//! │  d. confirm_counts(new_total)                                           │
//! │                                                                         │
//! │  all ok ──► live -= confirmed snapshot, unconfirmed = pending = 0,      │
//! │             last_confirmed = new_total                                  │
//! │                                                                         │
//! │  failure after (b) landed: live is still shown, the landed upload is    │
//! │  subtracted from the remote's unconfirmed sum on refresh, and the next  │
//! │  attempt re-sends the same upload_id (ignored by the remote).           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::engine::EngineContext;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::drain_queue;
use crate::remote::{bounded, CountUpload, RemoteStore};

/// What a confirm request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Live count was zero; nothing changed.
    NothingToConfirm,
    /// The remote accepted the new confirmed total.
    Confirmed { new_total: i64 },
    /// The remote was unreachable; live counts were parked locally.
    Queued { pending: i64 },
}

/// Runs the confirmation workflow.
pub(crate) async fn confirm<R: RemoteStore>(ctx: &EngineContext<R>) -> SyncResult<ConfirmOutcome> {
    let mut conn = ctx.gate.lock().await;

    let live = ctx.counts.read().await.live_count();
    if live == 0 {
        return Ok(ConfirmOutcome::NothingToConfirm);
    }

    if conn.is_connected() {
        let new_total = confirm_online(ctx, &mut conn, live).await?;
        Ok(ConfirmOutcome::Confirmed { new_total })
    } else {
        let pending = park_live(ctx, live).await?;
        info!(count = live, pending, "Remote unreachable, counts queued locally");
        Ok(ConfirmOutcome::Queued { pending })
    }
}

async fn confirm_online<R: RemoteStore>(
    ctx: &EngineContext<R>,
    conn: &mut ConnectionManager,
    live: i64,
) -> SyncResult<i64> {
    // a. Older queued counts go first so they are part of the new total.
    let drained = drain_queue(ctx, conn).await?;
    if let Some(err) = drained.failure {
        if drained.records > 0 {
            // Those records stay uploaded; only the confirm itself failed.
            warn!(
                records = drained.records,
                count = drained.count,
                "Queue partly drained before confirmation failed"
            );
        }
        return Err(err);
    }

    // b. Upload the live count
    let staged = ctx.counts.write().await.stage_confirmation(live, Utc::now());
    for upload in &staged {
        let body = CountUpload::from(upload);
        let call = ctx.remote.upload_count_record(&ctx.head_name, &body);
        if let Err(err) = bounded("upload", ctx.query_timeout, call).await {
            return Err(lost(ctx, conn, err).await);
        }
        ctx.counts.write().await.mark_staged_landed(upload.upload_id);
    }

    // c. Read back what the remote now knows
    let call = ctx.remote.get_current_counts(&ctx.head_name);
    let remote = match bounded("read", ctx.query_timeout, call).await {
        Ok(remote) => remote,
        Err(err) => return Err(lost(ctx, conn, err).await),
    };
    let pending = ctx.queue.total_pending().await?;
    let new_total = remote.known_total() + pending;

    // d. Commit the new total
    let call = ctx.remote.confirm_counts(&ctx.head_name, new_total);
    if let Err(err) = bounded("confirm", ctx.query_timeout, call).await {
        return Err(lost(ctx, conn, err).await);
    }

    {
        let mut counts = ctx.counts.write().await;
        counts.settle_confirmed(new_total, live);
        counts.set_pending(pending);
        counts.mark_synced(Utc::now());
    }

    info!(head = %ctx.head_name, count = live, new_total, "Counts confirmed");
    Ok(new_total)
}

/// Parks `live` counts in the local queue and settles the counters.
///
/// Must be called with the engine gate held. On a write failure the live
/// count is kept and a retry is flagged for the next reconcile tick.
///
/// ## Returns
/// The queue's pending total after the write.
pub(crate) async fn park_live<R: RemoteStore>(ctx: &EngineContext<R>, live: i64) -> SyncResult<i64> {
    let batches = ctx.counts.read().await.park_batches(live, Utc::now());

    if let Err(err) = ctx.queue.add_records(&batches).await {
        ctx.counts.write().await.request_persist_retry();
        warn!(count = live, error = %err, "Failed to park counts locally, will retry");
        return Err(err.into());
    }

    let parked: i64 = batches.iter().map(|b| b.count).sum();
    let pending = match ctx.queue.total_pending().await {
        Ok(pending) => pending,
        Err(err) => {
            // The write committed; estimate until the next tick recounts.
            warn!(error = %err, "Failed to read queue total after parking");
            ctx.counts.read().await.pending_upload_count() + parked
        }
    };

    ctx.counts.write().await.settle_queued(live, pending);
    Ok(pending)
}

async fn lost<R: RemoteStore>(
    ctx: &EngineContext<R>,
    conn: &mut ConnectionManager,
    err: SyncError,
) -> SyncError {
    if err.is_connection_loss() {
        conn.link_lost(&ctx.remote, &err).await;
    }
    err
}
