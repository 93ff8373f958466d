//! # Console Status Display
//!
//! Renders engine snapshots to stdout. A line is printed only when the
//! snapshot changed since the last render.
//!
//! ```text
//! [online ] live 3 | pending 0 | unconfirmed 2 | confirmed 100 | TOTAL 105
//! [offline] live 0 | pending 5 | unconfirmed 0 | confirmed 0 | TOTAL 5 (paused)
//! ```

use serde::Serialize;
use tally_core::{ConnectionStatus, SystemState};
use tally_sync::StatusSink;

/// Prints status lines, as text or JSON.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    json: bool,
    last: Option<SystemState>,
}

impl ConsoleDisplay {
    pub fn new(json: bool) -> Self {
        ConsoleDisplay { json, last: None }
    }

    /// Returns the line for `state`, or `None` if nothing changed.
    fn next_line(&mut self, state: &SystemState) -> Option<String> {
        if self.last.as_ref() == Some(state) {
            return None;
        }
        self.last = Some(state.clone());

        if self.json {
            serde_json::to_string(&JsonStatus::from(state)).ok()
        } else {
            Some(format_status(state))
        }
    }
}

impl StatusSink for ConsoleDisplay {
    fn render(&mut self, state: &SystemState) {
        if let Some(line) = self.next_line(state) {
            println!("{line}");
        }
    }
}

/// JSON status line; carries the derived total alongside the snapshot.
#[derive(Serialize)]
struct JsonStatus<'a> {
    #[serde(flatten)]
    state: &'a SystemState,
    total_unconfirmed: i64,
}

impl<'a> From<&'a SystemState> for JsonStatus<'a> {
    fn from(state: &'a SystemState) -> Self {
        JsonStatus {
            state,
            total_unconfirmed: state.total_unconfirmed(),
        }
    }
}

fn status_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "online ",
        ConnectionStatus::Connecting => "connect",
        ConnectionStatus::Disconnected => "offline",
        ConnectionStatus::Error => "error  ",
    }
}

/// Formats one human-readable status line.
pub fn format_status(state: &SystemState) -> String {
    let mut line = format!(
        "[{}] live {} | pending {} | unconfirmed {} | confirmed {} | TOTAL {}",
        status_label(state.connection_status),
        state.live_count,
        state.pending_upload_count,
        state.unconfirmed_remote_count,
        state.last_confirmed_count,
        state.total_unconfirmed(),
    );
    if state.paused {
        line.push_str(" (paused)");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SystemState {
        SystemState {
            live_count: 3,
            last_confirmed_count: 100,
            unconfirmed_remote_count: 2,
            connection_status: ConnectionStatus::Connected,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_status() {
        let line = format_status(&sample());
        assert_eq!(
            line,
            "[online ] live 3 | pending 0 | unconfirmed 2 | confirmed 100 | TOTAL 105"
        );
    }

    #[test]
    fn test_paused_is_marked() {
        let state = SystemState {
            paused: true,
            ..sample()
        };
        assert!(format_status(&state).ends_with("(paused)"));
    }

    #[test]
    fn test_unchanged_state_prints_once() {
        let mut display = ConsoleDisplay::new(false);
        assert!(display.next_line(&sample()).is_some());
        assert!(display.next_line(&sample()).is_none());

        let changed = SystemState {
            live_count: 4,
            ..sample()
        };
        assert!(display.next_line(&changed).is_some());
    }

    #[test]
    fn test_json_line_includes_total() {
        let mut display = ConsoleDisplay::new(true);
        let line = display.next_line(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["total_unconfirmed"], 105);
        assert_eq!(value["live_count"], 3);
        assert_eq!(value["connection_status"], "connected");
    }
}
