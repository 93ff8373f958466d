//! # In-Memory Remote Store
//!
//! A [`RemoteStore`] kept in process memory, with switches to simulate an
//! unreachable server, dropped links and slow calls. Used by the scenario
//! tests and by `tally-edge --dry-run`.
//!
//! Events carry a sequence number; a line's unconfirmed sum is the sum of
//! its events logged after the sequence number recorded at its last
//! confirmation.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CountUpload, RemoteStore};
use crate::error::{SyncError, SyncResult};
use tally_core::RemoteCounts;

/// One accepted upload in the remote event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub seq: u64,
    pub head_name: String,
    pub upload_id: Uuid,
    pub count: i64,
    pub recorded_at: DateTime<Utc>,
}

/// How many times each call was made (including failed ones).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connects: u32,
    pub reads: u32,
    pub uploads: u32,
    pub confirms: u32,
}

impl CallCounts {
    /// Calls other than connect/disconnect.
    pub fn data_calls(&self) -> u32 {
        self.reads + self.uploads + self.confirms
    }
}

#[derive(Debug, Default)]
struct Line {
    confirmed: i64,
    confirmed_seq: u64,
    active: bool,
}

#[derive(Debug)]
struct State {
    reachable: bool,
    connected: bool,
    /// An outage leaves the client session open (like a pool whose
    /// sockets died), and connect reuses it without reaching the server.
    session_survives_outage: bool,
    latency: Duration,
    fail_uploads: u32,
    fail_confirms: u32,
    fail_reads: u32,
    lines: HashMap<String, Line>,
    events: Vec<LoggedEvent>,
    seen: HashSet<Uuid>,
    next_seq: u64,
    calls: CallCounts,
}

impl State {
    fn check_link(&mut self) -> SyncResult<()> {
        if !self.reachable {
            if !self.session_survives_outage {
                self.connected = false;
            }
            return Err(SyncError::RemoteConnect("server unreachable".into()));
        }
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }

    /// Consumes one injected failure, dropping the link.
    fn take_fault(counter: &mut u32, connected: &mut bool, call: &str) -> SyncResult<()> {
        if *counter > 0 {
            *counter -= 1;
            *connected = false;
            return Err(SyncError::RemoteConnect(format!("connection reset during {call}")));
        }
        Ok(())
    }
}

/// In-process remote store.
///
/// Cheap to clone; clones share state, so a test can keep one clone to
/// inspect and flip switches while the engine owns another.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates a reachable store with no lines.
    pub fn new() -> Self {
        MemoryRemote {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                connected: false,
                session_survives_outage: false,
                latency: Duration::ZERO,
                fail_uploads: 0,
                fail_confirms: 0,
                fail_reads: 0,
                lines: HashMap::new(),
                events: Vec::new(),
                seen: HashSet::new(),
                next_seq: 1,
                calls: CallCounts::default(),
            })),
        }
    }

    /// Registers a line with a confirmed total.
    pub async fn add_line(&self, head_name: &str, confirmed: i64) {
        let mut state = self.state.lock().await;
        let confirmed_seq = state.next_seq - 1;
        state.lines.insert(
            head_name.to_string(),
            Line {
                confirmed,
                confirmed_seq,
                active: false,
            },
        );
    }

    /// Logs an event as if another writer had uploaded it.
    pub async fn seed_event(&self, head_name: &str, count: i64) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        let upload_id = Uuid::new_v4();
        state.seen.insert(upload_id);
        state.events.push(LoggedEvent {
            seq,
            head_name: head_name.to_string(),
            upload_id,
            count,
            recorded_at: Utc::now(),
        });
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Makes the server reachable or not. Going unreachable drops the link
    /// unless the session is set to survive outages.
    pub async fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().await;
        state.reachable = reachable;
        if !reachable && !state.session_survives_outage {
            state.connected = false;
        }
    }

    /// Keeps the client session open across outages; only `disconnect`
    /// closes it. Models a connection pool that outlives its sockets.
    pub async fn set_session_survives_outage(&self, survives: bool) {
        self.state.lock().await.session_survives_outage = survives;
    }

    /// Delays every call by `latency` (use with paused time).
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// The next `n` uploads fail with a dropped link, without logging.
    pub async fn fail_next_uploads(&self, n: u32) {
        self.state.lock().await.fail_uploads = n;
    }

    /// The next `n` confirmations fail with a dropped link, changing nothing.
    pub async fn fail_next_confirms(&self, n: u32) {
        self.state.lock().await.fail_confirms = n;
    }

    /// The next `n` count reads fail with a dropped link.
    pub async fn fail_next_reads(&self, n: u32) {
        self.state.lock().await.fail_reads = n;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    /// Every accepted event, in log order.
    pub async fn events(&self) -> Vec<LoggedEvent> {
        self.state.lock().await.events.clone()
    }

    /// Sum of every accepted event for a line.
    pub async fn logged_total(&self, head_name: &str) -> i64 {
        let state = self.state.lock().await;
        state
            .events
            .iter()
            .filter(|e| e.head_name == head_name)
            .map(|e| e.count)
            .sum()
    }

    /// Confirmed total of a line, if the line exists.
    pub async fn confirmed_total(&self, head_name: &str) -> Option<i64> {
        self.state.lock().await.lines.get(head_name).map(|l| l.confirmed)
    }

    /// Running status of a line, if the line exists.
    pub async fn is_active(&self, head_name: &str) -> Option<bool> {
        self.state.lock().await.lines.get(head_name).map(|l| l.active)
    }

    async fn delay(&self) {
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RemoteStore for MemoryRemote {
    async fn connect(&self) -> SyncResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.calls.connects += 1;
        if state.connected && state.session_survives_outage {
            return Ok(());
        }
        if !state.reachable {
            return Err(SyncError::RemoteConnect("server unreachable".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().await.connected = false;
    }

    async fn get_current_counts(&self, head_name: &str) -> SyncResult<RemoteCounts> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.calls.reads += 1;
        state.check_link()?;
        let State {
            fail_reads,
            connected,
            ..
        } = &mut *state;
        State::take_fault(fail_reads, connected, "read")?;

        let Some(line) = state.lines.get(head_name) else {
            debug!(head = %head_name, "Unknown line, reporting zero counts");
            return Ok(RemoteCounts::default());
        };

        let unconfirmed = state
            .events
            .iter()
            .filter(|e| e.head_name == head_name && e.seq > line.confirmed_seq)
            .map(|e| e.count)
            .sum();

        Ok(RemoteCounts {
            confirmed: line.confirmed,
            unconfirmed,
        })
    }

    async fn upload_count_record(&self, head_name: &str, upload: &CountUpload) -> SyncResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.calls.uploads += 1;
        state.check_link()?;
        let State {
            fail_uploads,
            connected,
            ..
        } = &mut *state;
        State::take_fault(fail_uploads, connected, "upload")?;

        if !state.seen.insert(upload.upload_id) {
            debug!(upload_id = %upload.upload_id, "Duplicate upload ignored");
            return Ok(());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.events.push(LoggedEvent {
            seq,
            head_name: head_name.to_string(),
            upload_id: upload.upload_id,
            count: upload.count,
            recorded_at: upload.recorded_at,
        });
        Ok(())
    }

    async fn confirm_counts(&self, head_name: &str, new_total: i64) -> SyncResult<()> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.calls.confirms += 1;
        state.check_link()?;
        let State {
            fail_confirms,
            connected,
            ..
        } = &mut *state;
        State::take_fault(fail_confirms, connected, "confirm")?;

        let last_seq = state.next_seq - 1;
        let line = state
            .lines
            .get_mut(head_name)
            .ok_or_else(|| SyncError::UnknownHead(head_name.to_string()))?;
        line.confirmed = new_total;
        line.confirmed_seq = last_seq;
        line.active = new_total > 0;
        Ok(())
    }
}
