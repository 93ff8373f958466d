//! End-to-end behavior of the engine against an in-memory remote store and
//! an in-memory local queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally_core::{ConnectionStatus, SensorError, SensorSource, SystemState};
use tally_db::{Database, DbConfig};
use tally_sync::{
    ConfirmOutcome, Engine, EngineHandle, MemoryRemote, NoOpSink, StatusSink, SyncError,
    TallyConfig,
};

const HEAD: &str = "PRESS-04";

struct Fixture {
    engine: Engine<MemoryRemote>,
    handle: EngineHandle<MemoryRemote>,
    remote: MemoryRemote,
    db: Database,
}

async fn fixture(confirmed: i64, seeded_unconfirmed: i64) -> Fixture {
    let remote = MemoryRemote::new();
    remote.add_line(HEAD, confirmed).await;
    if seeded_unconfirmed > 0 {
        remote.seed_event(HEAD, seeded_unconfirmed).await;
    }

    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let config = TallyConfig::for_line(HEAD, "mysql://localhost/production");
    let engine = Engine::new(&config, remote.clone(), &db);
    let handle = engine.handle();

    Fixture {
        engine,
        handle,
        remote,
        db,
    }
}

async fn count(handle: &EngineHandle<MemoryRemote>, n: usize) {
    for _ in 0..n {
        assert!(handle.record_event().await);
    }
}

// =============================================================================
// Counting
// =============================================================================

#[tokio::test]
async fn test_events_only_count_while_active() {
    let f = fixture(0, 0).await;
    count(&f.handle, 4).await;

    f.handle.pause().await.unwrap();
    assert!(!f.handle.record_event().await);
    f.handle.resume().await;
    count(&f.handle, 1).await;

    let snap = f.handle.snapshot().await;
    // Pausing while offline parked the first 4
    assert_eq!(snap.live_count, 1);
    assert_eq!(snap.pending_upload_count, 4);
    assert!(!snap.paused);
}

#[tokio::test]
async fn test_pause_while_connected_keeps_live_count() {
    let f = fixture(0, 0).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;

    f.handle.pause().await.unwrap();

    let snap = f.handle.snapshot().await;
    assert!(snap.paused);
    assert_eq!(snap.live_count, 3);
    assert_eq!(snap.pending_upload_count, 0);
}

#[tokio::test]
async fn test_reset_discards_only_live() {
    let f = fixture(100, 2).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;

    assert_eq!(f.handle.reset().await, 3);

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.last_confirmed_count, 100);
    assert_eq!(snap.unconfirmed_remote_count, 2);
}

// =============================================================================
// Confirmation
// =============================================================================

#[tokio::test]
async fn test_confirm_with_nothing_live_changes_nothing() {
    let f = fixture(100, 2).await;
    f.handle.tick().await.unwrap();
    let before = f.handle.snapshot().await;
    let calls_before = f.remote.calls().await;

    let outcome = f.handle.confirm().await.unwrap();

    assert_eq!(outcome, ConfirmOutcome::NothingToConfirm);
    assert_eq!(f.handle.snapshot().await, before);
    assert_eq!(f.remote.calls().await, calls_before);
}

/// Offline confirm parks counts locally without touching the remote.
#[tokio::test]
async fn test_offline_confirm_queues_counts() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 5).await;

    let outcome = f.handle.confirm().await.unwrap();

    assert_eq!(outcome, ConfirmOutcome::Queued { pending: 5 });
    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.pending_upload_count, 5);
    assert_eq!(f.db.queue().total_pending().await.unwrap(), 5);
    assert_eq!(f.remote.calls().await.data_calls(), 0);
    assert_eq!(f.remote.calls().await.connects, 0);
}

/// Queued counts move to the remote once it is reachable again.
#[tokio::test]
async fn test_queued_counts_upload_after_reconnect() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 5).await;
    f.handle.confirm().await.unwrap();

    // Offline tick: connect fails, backoff starts
    assert!(f.handle.tick().await.is_err());
    assert_eq!(f.handle.connection_status(), ConnectionStatus::Disconnected);

    // Backoff still running: nothing happens
    f.remote.set_reachable(true).await;
    let report = f.handle.tick().await.unwrap();
    assert!(!report.online);

    let report = f.handle.sync_now().await.unwrap();
    assert!(report.online);
    assert_eq!(report.uploaded_count, 5);
    assert_eq!(report.pending, 0);

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.pending_upload_count, 0);
    assert_eq!(snap.unconfirmed_remote_count, 5);
    assert_eq!(snap.connection_status, ConnectionStatus::Connected);
    assert!(snap.last_sync_time.is_some());
    assert_eq!(f.remote.logged_total(HEAD).await, 5);
}

/// Online confirm folds live counts into the confirmed total.
#[tokio::test]
async fn test_online_confirm_updates_confirmed_total() {
    let f = fixture(100, 2).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;
    assert_eq!(f.handle.snapshot().await.total_unconfirmed(), 105);

    let outcome = f.handle.confirm().await.unwrap();

    assert_eq!(outcome, ConfirmOutcome::Confirmed { new_total: 105 });
    assert_eq!(f.remote.confirmed_total(HEAD).await, Some(105));
    assert_eq!(f.remote.is_active(HEAD).await, Some(true));

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.unconfirmed_remote_count, 0);
    assert_eq!(snap.pending_upload_count, 0);
    assert_eq!(snap.last_confirmed_count, 105);

    // A later refresh agrees
    f.handle.tick().await.unwrap();
    let snap = f.handle.snapshot().await;
    assert_eq!(snap.last_confirmed_count, 105);
    assert_eq!(snap.unconfirmed_remote_count, 0);
}

/// Confirm fails after the live upload landed; the retry does not count it
/// twice.
#[tokio::test]
async fn test_failed_confirm_retry_does_not_double_count() {
    let f = fixture(100, 2).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;
    let before = f.handle.snapshot().await;

    f.remote.fail_next_confirms(1).await;
    let err = f.handle.confirm().await.unwrap_err();
    assert!(err.is_connection_loss());

    let after = f.handle.snapshot().await;
    assert_eq!(after.live_count, 3);
    assert_eq!(after.last_confirmed_count, before.last_confirmed_count);
    assert_eq!(after.unconfirmed_remote_count, before.unconfirmed_remote_count);
    assert_eq!(after.pending_upload_count, 0);
    assert_eq!(after.connection_status, ConnectionStatus::Disconnected);
    // The upload itself landed
    assert_eq!(f.remote.logged_total(HEAD).await, 5);

    // Reconnect: the landed upload is not shown twice
    f.handle.sync_now().await.unwrap();
    let snap = f.handle.snapshot().await;
    assert_eq!(snap.unconfirmed_remote_count, 2);
    assert_eq!(snap.live_count, 3);
    assert_eq!(snap.total_unconfirmed(), 105);

    let outcome = f.handle.confirm().await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::Confirmed { new_total: 105 });
    assert_eq!(f.remote.confirmed_total(HEAD).await, Some(105));
    assert_eq!(f.remote.events().await.len(), 2);
    assert_eq!(f.handle.snapshot().await.live_count, 0);
}

#[tokio::test]
async fn test_offline_confirm_after_landed_upload_does_not_requeue() {
    let f = fixture(100, 2).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;

    f.remote.fail_next_confirms(1).await;
    f.handle.confirm().await.unwrap_err();

    // Now offline: the landed 3 must not be parked again
    let outcome = f.handle.confirm().await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::Queued { pending: 0 });

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.pending_upload_count, 0);
    assert_eq!(snap.unconfirmed_remote_count, 5);
    assert_eq!(snap.total_unconfirmed(), 105);

    f.handle.sync_now().await.unwrap();
    assert_eq!(f.handle.snapshot().await.total_unconfirmed(), 105);
    assert_eq!(f.remote.logged_total(HEAD).await, 5);
}

#[tokio::test]
async fn test_offline_confirm_after_lost_upload_reuses_upload_id() {
    let f = fixture(0, 0).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;

    // The staged upload fails: outcome unknown to the device
    f.remote.fail_next_uploads(1).await;
    f.handle.confirm().await.unwrap_err();
    assert_eq!(f.handle.snapshot().await.live_count, 3);

    let outcome = f.handle.confirm().await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::Queued { pending: 3 });

    f.handle.sync_now().await.unwrap();
    assert_eq!(f.remote.logged_total(HEAD).await, 3);
    assert_eq!(f.remote.events().await.len(), 1);
}

#[tokio::test]
async fn test_confirm_unknown_line_keeps_counts_and_connection() {
    let remote = MemoryRemote::new();
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let config = TallyConfig::for_line("NO-SUCH-LINE", "mysql://localhost/production");
    let handle = Engine::new(&config, remote.clone(), &db).handle();

    handle.tick().await.unwrap();
    assert!(handle.record_event().await);

    let err = handle.confirm().await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownHead(_)));
    assert_eq!(handle.snapshot().await.live_count, 1);
    assert_eq!(handle.connection_status(), ConnectionStatus::Connected);
}

// =============================================================================
// Queue Drain
// =============================================================================

#[tokio::test]
async fn test_drain_stops_at_first_failure() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 3).await;
    f.handle.confirm().await.unwrap();
    count(&f.handle, 2).await;
    f.handle.confirm().await.unwrap();

    f.remote.set_reachable(true).await;
    f.remote.fail_next_uploads(1).await;
    let err = f.handle.sync_now().await.unwrap_err();
    assert!(err.is_connection_loss());

    let pending = f.db.queue().get_pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_error.is_some());
    // No skip-ahead past the failed record
    assert_eq!(pending[1].retry_count, 0);
    assert!(f.remote.events().await.is_empty());
    assert_eq!(f.handle.snapshot().await.pending_upload_count, 5);

    f.handle.sync_now().await.unwrap();
    let counts: Vec<i64> = f.remote.events().await.iter().map(|e| e.count).collect();
    assert_eq!(counts, vec![3, 2]);
    assert_eq!(f.handle.snapshot().await.pending_upload_count, 0);
}

/// A record whose "uploaded" mark was lost is sent again but logged once.
#[tokio::test]
async fn test_queued_record_uploaded_at_most_once() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 5).await;
    f.handle.confirm().await.unwrap();

    f.remote.set_reachable(true).await;
    f.handle.sync_now().await.unwrap();
    assert_eq!(f.remote.logged_total(HEAD).await, 5);

    // Simulate a crash between the upload and the local mark
    sqlx::query("UPDATE count_queue SET uploaded = 0, uploaded_at = NULL")
        .execute(f.db.pool())
        .await
        .unwrap();

    let report = f.handle.tick().await.unwrap();
    assert_eq!(report.uploaded_records, 1);
    assert_eq!(f.remote.logged_total(HEAD).await, 5);
    assert_eq!(f.remote.events().await.len(), 1);
    assert_eq!(f.db.queue().total_pending().await.unwrap(), 0);

    // The next refresh corrects the local view
    f.handle.tick().await.unwrap();
    assert_eq!(f.handle.snapshot().await.unconfirmed_remote_count, 5);
}

#[tokio::test]
async fn test_confirm_drains_queue_first() {
    let f = fixture(100, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 4).await;
    f.handle.confirm().await.unwrap();

    f.remote.set_reachable(true).await;
    f.handle.sync_now().await.unwrap();
    count(&f.handle, 1).await;

    let outcome = f.handle.confirm().await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::Confirmed { new_total: 105 });
    assert_eq!(f.db.queue().total_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_restore_reads_pending_from_previous_run() {
    let f = fixture(0, 0).await;
    f.db.queue().add_record(7).await.unwrap();

    assert_eq!(f.engine.restore().await.unwrap(), 7);
    assert_eq!(f.handle.snapshot().await.pending_upload_count, 7);
}

/// Queued records uploaded before a confirmation fails stay uploaded; only
/// their place in the totals moves.
#[tokio::test]
async fn test_failed_confirm_keeps_drained_records_uploaded() {
    let f = fixture(100, 0).await;
    f.handle.tick().await.unwrap();
    f.db.queue().add_record(2).await.unwrap();
    f.db.queue().add_record(3).await.unwrap();
    f.engine.restore().await.unwrap();
    count(&f.handle, 4).await;
    let before = f.handle.snapshot().await;
    assert_eq!(before.pending_upload_count, 5);

    f.remote.fail_next_confirms(1).await;
    assert!(f.handle.confirm().await.is_err());

    let after = f.handle.snapshot().await;
    assert_eq!(after.live_count, 4);
    assert_eq!(after.pending_upload_count, 0);
    assert_eq!(after.unconfirmed_remote_count, 5);
    assert_eq!(after.last_confirmed_count, 100);
    assert_eq!(after.total_unconfirmed(), before.total_unconfirmed());
    assert_eq!(f.db.queue().count_pending().await.unwrap(), 0);
    assert_eq!(f.remote.confirmed_total(HEAD).await, Some(100));
}

// =============================================================================
// Local Store Failures
// =============================================================================

/// Makes every insert into the local queue fail, or lifts that again.
async fn reject_queue_writes(db: &Database, reject: bool) {
    let sql = if reject {
        "CREATE TRIGGER reject_queue_writes BEFORE INSERT ON count_queue \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END"
    } else {
        "DROP TRIGGER reject_queue_writes"
    };
    sqlx::query(sql).execute(db.pool()).await.unwrap();
}

#[tokio::test]
async fn test_failed_local_write_on_confirm_keeps_live_until_next_tick() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 5).await;
    reject_queue_writes(&f.db, true).await;

    let err = f.handle.confirm().await.unwrap_err();
    assert!(matches!(err, SyncError::LocalStore(_)));
    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 5);
    assert_eq!(snap.pending_upload_count, 0);

    // The next tick parks the counts first, even though it stays offline
    reject_queue_writes(&f.db, false).await;
    let _ = f.handle.tick().await;

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.pending_upload_count, 5);
    assert_eq!(f.db.queue().total_pending().await.unwrap(), 5);
}

#[tokio::test]
async fn test_failed_local_write_on_pause_keeps_live_until_next_tick() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    count(&f.handle, 4).await;
    reject_queue_writes(&f.db, true).await;

    let err = f.handle.pause().await.unwrap_err();
    assert!(matches!(err, SyncError::LocalStore(_)));
    let snap = f.handle.snapshot().await;
    assert!(snap.paused);
    assert_eq!(snap.live_count, 4);

    reject_queue_writes(&f.db, false).await;
    let _ = f.handle.tick().await;

    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.pending_upload_count, 4);
}

#[tokio::test]
async fn test_failed_local_write_on_shutdown_never_zeroes_live() {
    let f = fixture(0, 0).await;
    f.remote.set_reachable(false).await;
    let running = f.engine.start(
        QuietSensor {
            released: Arc::new(AtomicBool::new(false)),
        },
        NoOpSink,
    );
    count(&running.handle(), 3).await;
    reject_queue_writes(&f.db, true).await;

    let last = running.shutdown().await;

    assert_eq!(last.live_count, 3);
    assert_eq!(last.pending_upload_count, 0);
    assert_eq!(f.db.queue().count_pending().await.unwrap(), 0);
}

// =============================================================================
// Link Loss and Concurrency
// =============================================================================

/// A client session that outlives an outage must not be reused as if the
/// link were fine.
#[tokio::test]
async fn test_outage_closes_open_session() {
    let f = fixture(0, 0).await;
    f.remote.set_session_survives_outage(true).await;
    f.handle.tick().await.unwrap();
    assert!(f.remote.is_connected().await);

    f.remote.set_reachable(false).await;
    assert!(f.handle.tick().await.is_err());
    assert!(!f.remote.is_connected().await);
    assert_eq!(f.handle.connection_status(), ConnectionStatus::Disconnected);

    // A forced reconnect has to reach the server, and cannot
    assert!(f.handle.sync_now().await.is_err());
    assert_eq!(f.handle.connection_status(), ConnectionStatus::Disconnected);
    assert!(!f.remote.is_connected().await);

    f.remote.set_reachable(true).await;
    f.handle.sync_now().await.unwrap();
    assert_eq!(f.handle.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_reset_waits_for_running_confirmation() {
    let f = fixture(100, 0).await;
    f.handle.tick().await.unwrap();
    count(&f.handle, 3).await;
    f.remote.set_latency(Duration::from_millis(100)).await;

    let confirming = tokio::spawn({
        let handle = f.handle.clone();
        async move { handle.confirm().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The confirmation owns these counts; reset finds nothing left
    let discarded = f.handle.reset().await;
    let outcome = confirming.await.unwrap().unwrap();

    assert_eq!(outcome, ConfirmOutcome::Confirmed { new_total: 103 });
    assert_eq!(discarded, 0);
    let snap = f.handle.snapshot().await;
    assert_eq!(snap.live_count, 0);
    assert_eq!(snap.last_confirmed_count, 103);
}

// =============================================================================
// Running Engine
// =============================================================================

struct QuietSensor {
    released: Arc<AtomicBool>,
}

impl SensorSource for QuietSensor {
    fn read(&mut self) -> Result<bool, SensorError> {
        Ok(false)
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<SystemState>>>,
}

impl StatusSink for RecordingSink {
    fn render(&mut self, state: &SystemState) {
        self.seen.lock().unwrap().push(state.clone());
    }
}

#[tokio::test]
async fn test_shutdown_parks_live_counts_and_releases_sensor() {
    let f = fixture(0, 0).await;
    let released = Arc::new(AtomicBool::new(false));
    let sink = RecordingSink::default();

    let running = f.engine.start(
        QuietSensor {
            released: Arc::clone(&released),
        },
        sink.clone(),
    );
    let handle = running.handle();
    count(&handle, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let last = running.shutdown().await;

    assert_eq!(last.live_count, 0);
    assert_eq!(last.pending_upload_count, 3);
    assert_eq!(f.db.queue().total_pending().await.unwrap(), 3);
    assert!(released.load(Ordering::SeqCst));
    assert!(!f.remote.is_connected().await);
    assert!(!sink.seen.lock().unwrap().is_empty());

    // Operator actions are refused once stopped
    assert!(matches!(handle.confirm().await, Err(SyncError::ShuttingDown)));
}

#[tokio::test]
async fn test_started_engine_connects_on_first_tick() {
    let f = fixture(100, 2).await;
    let running = f.engine.start(
        QuietSensor {
            released: Arc::new(AtomicBool::new(false)),
        },
        NoOpSink,
    );
    let handle = running.handle();

    let mut status = handle.watch_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.is_connected()),
    )
    .await
    .unwrap()
    .unwrap();

    running.shutdown().await;
    assert_eq!(f.remote.calls().await.connects, 1);
}
