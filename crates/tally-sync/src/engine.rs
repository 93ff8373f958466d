//! # Engine
//!
//! Wires the counters, the local queue and the remote store together and
//! runs the device's background tasks.
//!
//! ## Tasks and Locks
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Running Engine                                 │
//! │                                                                         │
//! │  sampler (100 ms)      reconciler (30 s)       publisher (1 s)          │
//! │  EdgeDetector::sample  run_tick()              StatusSink::render()     │
//! │       │                     │                        │                  │
//! │       │ write (short)       │ gate (whole tick)      │ read (short)     │
//! │       ▼                     ▼                        ▼                  │
//! │  ┌──────────────────┐  ┌──────────────────────┐                         │
//! │  │ RwLock           │  │ Mutex                │                         │
//! │  │ CountState       │  │ ConnectionManager    │◄── confirm(), pause()   │
//! │  │ (never held      │  │ (the gate: every     │    offline, shutdown    │
//! │  │  across a call)  │  │  remote call, every  │                         │
//! │  └──────────────────┘  │  queue write)        │                         │
//! │                        └──────────────────────┘                         │
//! │                                                                         │
//! │  shutdown: watch signal ─► tasks stop ─► park live counts ─►            │
//! │            disconnect remote ─► sensor released                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::TallyConfig;
use crate::confirm::{self, park_live, ConfirmOutcome};
use crate::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{self, TickReport};
use crate::remote::RemoteStore;
use tally_core::{ConnectionStatus, CountState, EdgeDetector, SensorSource, SystemState};
use tally_db::{CountQueueRepository, Database};

/// How long shutdown waits for each task before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Consecutive sensor failures logged at warn level before going quiet.
const SENSOR_WARN_LIMIT: u32 = 3;

// =============================================================================
// Status Sink
// =============================================================================

/// Receives periodic read-only snapshots (display, status LED, log).
pub trait StatusSink: Send + 'static {
    fn render(&mut self, state: &SystemState);
}

/// A sink that drops every snapshot.
pub struct NoOpSink;

impl StatusSink for NoOpSink {
    fn render(&mut self, _state: &SystemState) {}
}

// =============================================================================
// Shared Context
// =============================================================================

/// State shared by the engine's tasks and handles.
pub(crate) struct EngineContext<R> {
    pub head_name: String,
    pub query_timeout: Duration,
    pub retry_warn_threshold: i64,
    pub retention_days: u32,
    pub counts: RwLock<CountState>,
    /// Serialises reconcile ticks, confirmations and queue writes.
    pub gate: Mutex<ConnectionManager>,
    pub status_rx: watch::Receiver<ConnectionStatus>,
    pub remote: R,
    pub queue: CountQueueRepository,
    /// Set once shutdown starts; operator actions are refused after that.
    pub stopping: AtomicBool,
}

impl<R: RemoteStore> EngineContext<R> {
    fn ensure_running(&self) -> SyncResult<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    async fn snapshot(&self) -> SystemState {
        let status = *self.status_rx.borrow();
        self.counts.read().await.snapshot(status)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Count reconciliation engine for one production line.
///
/// ## Usage
/// ```rust,ignore
/// let engine = Engine::new(&config, remote, &db);
/// let handle = engine.handle();
/// let running = engine.start(sensor, display);
///
/// handle.confirm().await?;
/// running.shutdown().await;
/// ```
pub struct Engine<R> {
    config: TallyConfig,
    ctx: Arc<EngineContext<R>>,
}

impl<R: RemoteStore> Engine<R> {
    /// Creates an engine; nothing runs until [`start`](Self::start).
    pub fn new(config: &TallyConfig, remote: R, db: &Database) -> Self {
        let (conn, status_rx) = ConnectionManager::new(&config.sync, config.connect_timeout());

        let ctx = EngineContext {
            head_name: config.head_name().to_string(),
            query_timeout: config.query_timeout(),
            retry_warn_threshold: config.sync.retry_warn_threshold,
            retention_days: config.sync.retention_days,
            counts: RwLock::new(CountState::new()),
            gate: Mutex::new(conn),
            status_rx,
            remote,
            queue: db.queue(),
            stopping: AtomicBool::new(false),
        };

        Engine {
            config: config.clone(),
            ctx: Arc::new(ctx),
        }
    }

    /// Returns a handle for operator actions and snapshots.
    pub fn handle(&self) -> EngineHandle<R> {
        EngineHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Loads the pending total from the queue left by a previous run.
    pub async fn restore(&self) -> SyncResult<i64> {
        let pending = self.ctx.queue.total_pending().await?;
        self.ctx.counts.write().await.set_pending(pending);
        if pending > 0 {
            info!(pending, "Restored pending counts from local queue");
        }
        Ok(pending)
    }

    /// Spawns the sampler, reconciler and publisher tasks.
    pub fn start<S, K>(self, sensor: S, sink: K) -> RunningEngine<R>
    where
        S: SensorSource + 'static,
        K: StatusSink,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let detector = EdgeDetector::with_edge(sensor, self.config.sensor.edge);

        info!(
            head = %self.ctx.head_name,
            sample_ms = self.config.sensor.sample_interval_ms,
            reconcile_secs = self.config.sync.reconcile_interval_secs,
            "Engine starting"
        );

        let tasks = vec![
            (
                "sampler",
                tokio::spawn(run_sampler(
                    Arc::clone(&self.ctx),
                    detector,
                    self.config.sample_interval(),
                    shutdown_rx.clone(),
                )),
            ),
            (
                "reconciler",
                tokio::spawn(run_reconciler(
                    Arc::clone(&self.ctx),
                    self.config.reconcile_interval(),
                    shutdown_rx.clone(),
                )),
            ),
            (
                "publisher",
                tokio::spawn(run_publisher(
                    Arc::clone(&self.ctx),
                    sink,
                    self.config.refresh_interval(),
                    shutdown_rx,
                )),
            ),
        ];

        RunningEngine {
            ctx: self.ctx,
            shutdown_tx,
            tasks,
        }
    }
}

// =============================================================================
// Running Engine
// =============================================================================

/// An engine whose tasks are running.
pub struct RunningEngine<R> {
    ctx: Arc<EngineContext<R>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl<R: RemoteStore> RunningEngine<R> {
    pub fn handle(&self) -> EngineHandle<R> {
        EngineHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Stops every task, parks remaining live counts and disconnects.
    ///
    /// ## Returns
    /// The final snapshot.
    pub async fn shutdown(self) -> SystemState {
        info!("Shutting down engine");
        self.ctx.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        for (name, mut task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(err)) => error!(task = name, error = %err, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let ctx = &self.ctx;
        let mut conn = ctx.gate.lock().await;

        let live = ctx.counts.read().await.live_count();
        if live > 0 || ctx.counts.read().await.persist_retry_requested() {
            match park_live(ctx, live).await {
                Ok(pending) => info!(count = live, pending, "Live counts parked for next start"),
                Err(err) => error!(count = live, error = %err, "Live counts could not be parked"),
            }
        }

        conn.disconnect(&ctx.remote).await;
        drop(conn);

        let snapshot = ctx.snapshot().await;
        info!(pending = snapshot.pending_upload_count, "Engine stopped");
        snapshot
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Cloneable access to a running (or not yet started) engine.
pub struct EngineHandle<R> {
    ctx: Arc<EngineContext<R>>,
}

impl<R> Clone for EngineHandle<R> {
    fn clone(&self) -> Self {
        EngineHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<R: RemoteStore> EngineHandle<R> {
    /// Registers one detection. Returns false if counting is paused.
    pub async fn record_event(&self) -> bool {
        self.ctx.counts.write().await.on_event(Utc::now())
    }

    /// Stops counting. While offline the live count is also parked in the
    /// local queue so a power loss during the pause loses nothing.
    pub async fn pause(&self) -> SyncResult<()> {
        self.ctx.ensure_running()?;
        self.ctx.counts.write().await.pause();
        info!("Counting paused");

        let conn = self.ctx.gate.lock().await;
        let live = self.ctx.counts.read().await.live_count();
        if !conn.is_connected() && live > 0 {
            let pending = park_live(&self.ctx, live).await?;
            info!(count = live, pending, "Paused while offline, live counts parked");
        }
        Ok(())
    }

    pub async fn resume(&self) {
        self.ctx.counts.write().await.resume();
        info!("Counting resumed");
    }

    /// Discards the live count. Returns how many counts were discarded.
    ///
    /// Waits for any running tick or confirmation, so a staged upload is
    /// never forgotten while it is in flight.
    pub async fn reset(&self) -> i64 {
        let _gate = self.ctx.gate.lock().await;
        let discarded = self.ctx.counts.write().await.reset();
        info!(discarded, "Live count reset");
        discarded
    }

    /// Confirms the live count (see [`ConfirmOutcome`]).
    pub async fn confirm(&self) -> SyncResult<ConfirmOutcome> {
        self.ctx.ensure_running()?;
        let outcome = confirm::confirm(&self.ctx).await;
        if let Err(err) = &outcome {
            warn!(error = %err, "Confirmation failed, counts unchanged");
        }
        outcome
    }

    /// Runs a reconcile tick now, ignoring the reconnect backoff.
    pub async fn sync_now(&self) -> SyncResult<TickReport> {
        self.ctx.ensure_running()?;
        reconcile::run_tick(&self.ctx, true).await
    }

    /// Runs a reconcile tick as the background loop would.
    pub async fn tick(&self) -> SyncResult<TickReport> {
        reconcile::run_tick(&self.ctx, false).await
    }

    /// Copies the current counters.
    pub async fn snapshot(&self) -> SystemState {
        self.ctx.snapshot().await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.ctx.status_rx.borrow()
    }

    /// A receiver that is notified on every connection status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.ctx.status_rx.clone()
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn run_sampler<R: RemoteStore, S: SensorSource>(
    ctx: Arc<EngineContext<R>>,
    mut detector: EdgeDetector<S>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match detector.sample() {
                    Ok(Some(_)) => {
                        failures = 0;
                        let counted = ctx.counts.write().await.on_event(Utc::now());
                        debug!(counted, "Part detected");
                    }
                    Ok(None) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        if failures <= SENSOR_WARN_LIMIT {
                            warn!(error = %err, failures, "Sensor read failed, sample skipped");
                        } else {
                            debug!(error = %err, failures, "Sensor read failed, sample skipped");
                        }
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    detector.into_source().release();
    debug!("Sensor released");
}

async fn run_reconciler<R: RemoteStore>(
    ctx: Arc<EngineContext<R>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick fires immediately.
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconcile::run_tick(&ctx, false).await {
                    Ok(report) if report.uploaded_records > 0 => {
                        info!(uploaded = report.uploaded_count, pending = report.pending, "Reconciled");
                    }
                    Ok(_) => {}
                    Err(err) if err.is_retryable() => debug!(error = %err, "Reconcile tick failed"),
                    Err(err) => error!(error = %err, "Reconcile tick failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_publisher<R: RemoteStore, K: StatusSink>(
    ctx: Arc<EngineContext<R>>,
    mut sink: K,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = ctx.snapshot().await;
                sink.render(&snapshot);
            }
            _ = shutdown.changed() => break,
        }
    }
}
