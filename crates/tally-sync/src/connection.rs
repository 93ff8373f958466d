//! # Connection Manager
//!
//! Owns the connection lifecycle to the remote store and the reconnect
//! schedule.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Connection Lifecycle                                │
//! │                                                                         │
//! │  ┌──────────────┐  attempt due   ┌────────────┐   ok    ┌───────────┐  │
//! │  │ Disconnected │───────────────►│ Connecting │────────►│ Connected │  │
//! │  └──────▲───────┘                └─────┬──────┘         └─────┬─────┘  │
//! │         │        network failure       │                      │        │
//! │         ├──────────────────────────────┘                      │        │
//! │         │        network failure (call failed / timed out)    │        │
//! │         └─────────────────────────────────────────────────────┤        │
//! │                                                               │        │
//! │  ┌──────────────┐   unexpected failure                        │        │
//! │  │    Error     │◄────────────────────────────────────────────┘        │
//! │  └──────────────┘   (retried on the same schedule)                     │
//! │                                                                         │
//! │  Reconnect delays: 30s → 60s → 120s → 240s → 300s → 300s ...           │
//! │  Reset to 30s after any successful connection.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is the only writer of [`ConnectionStatus`]; readers hold a
//! `watch::Receiver`.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::remote::{bounded, RemoteStore};
use tally_core::ConnectionStatus;

/// Connection state and reconnect schedule.
#[derive(Debug)]
pub struct ConnectionManager {
    status: watch::Sender<ConnectionStatus>,
    backoff: ExponentialBackoff,
    max_delay: Duration,
    connect_timeout: Duration,
    /// Earliest time for the next attempt; `None` means now.
    next_attempt: Option<Instant>,
    /// Delay chosen after the latest failure.
    current_delay: Option<Duration>,
    consecutive_failures: u32,
}

impl ConnectionManager {
    /// Creates a disconnected manager and the receiver for its status.
    pub fn new(
        settings: &SyncSettings,
        connect_timeout: Duration,
    ) -> (Self, watch::Receiver<ConnectionStatus>) {
        let initial = Duration::from_secs(settings.initial_backoff_secs);
        let max_delay = Duration::from_secs(settings.max_backoff_secs);

        // No jitter: delays are strictly non-decreasing up to the ceiling.
        let backoff = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let manager = ConnectionManager {
            status,
            backoff,
            max_delay,
            connect_timeout,
            next_attempt: None,
            current_delay: None,
            consecutive_failures: 0,
        };
        (manager, status_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// A new receiver for status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Returns true if the backoff delay since the last failure has passed.
    pub fn attempt_due(&self) -> bool {
        self.next_attempt.map_or(true, |at| Instant::now() >= at)
    }

    /// Delay scheduled after the latest failure (`None` after a success).
    pub fn current_delay(&self) -> Option<Duration> {
        self.current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Attempts to connect, bounded by the connect timeout.
    ///
    /// On failure the status moves to `Disconnected` (or `Error`) and the
    /// next attempt is scheduled; the error is returned for the caller to
    /// report.
    pub async fn connect<R: RemoteStore>(&mut self, remote: &R) -> SyncResult<()> {
        self.set_status(ConnectionStatus::Connecting);
        debug!(attempt = self.consecutive_failures + 1, "Connecting to remote store");

        match bounded("connect", self.connect_timeout, remote.connect()).await {
            Ok(()) => {
                self.backoff.reset();
                self.next_attempt = None;
                self.current_delay = None;
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "Remote store reachable again"
                    );
                }
                self.consecutive_failures = 0;
                self.set_status(ConnectionStatus::Connected);
                Ok(())
            }
            Err(err) => {
                // A half-open connection is closed before retrying.
                remote.disconnect().await;
                self.mark_lost(&err);
                Err(err)
            }
        }
    }

    /// Records a failure of a connect attempt or of an established link.
    ///
    /// Network failures return to `Disconnected`; anything else to `Error`.
    /// Both schedule the next attempt on the backoff curve.
    pub fn mark_lost(&mut self, err: &SyncError) {
        let next = if err.is_connection_loss() {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Error
        };

        let delay = self.backoff.next_backoff().unwrap_or(self.max_delay);
        self.consecutive_failures += 1;
        self.current_delay = Some(delay);
        self.next_attempt = Some(Instant::now() + delay);

        warn!(
            error = %err,
            status = %next,
            retry_in_secs = delay.as_secs(),
            failures = self.consecutive_failures,
            "Remote store unavailable"
        );
        self.set_status(next);
    }

    /// Records the failure of a call on an established link.
    ///
    /// The remote session is closed first, so the next attempt has to
    /// reach the server instead of reusing a session whose sockets are
    /// gone.
    pub async fn link_lost<R: RemoteStore>(&mut self, remote: &R, err: &SyncError) {
        remote.disconnect().await;
        self.mark_lost(err);
    }

    /// Closes the link and marks the manager disconnected.
    pub async fn disconnect<R: RemoteStore>(&mut self, remote: &R) {
        remote.disconnect().await;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Connection status changed");
            *current = next;
            true
        });
    }
}
