//! # Operator Commands
//!
//! One command per stdin line. Each maps onto an engine handle call.
//!
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ Command │ Action                                       │
//! ├─────────┼──────────────────────────────────────────────┤
//! │ p       │ pause counting (parks counts while offline)  │
//! │ r       │ resume counting                              │
//! │ x       │ reset (discard) the live count               │
//! │ c       │ confirm the live count                       │
//! │ s       │ sync now, ignoring reconnect backoff         │
//! │ e       │ record one detection by hand                 │
//! │ h       │ help                                         │
//! │ q       │ quit                                         │
//! └─────────┴──────────────────────────────────────────────┘
//! ```

use std::str::FromStr;

use tally_sync::{ConfirmOutcome, EngineHandle, RemoteStore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

pub const HELP: &str = "commands: p=pause r=resume x=reset c=confirm s=sync e=event h=help q=quit";

/// A parsed operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Reset,
    Confirm,
    Sync,
    Event,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p" | "pause" => Ok(Command::Pause),
            "r" | "resume" => Ok(Command::Resume),
            "x" | "reset" => Ok(Command::Reset),
            "c" | "confirm" => Ok(Command::Confirm),
            "s" | "sync" => Ok(Command::Sync),
            "e" | "event" => Ok(Command::Event),
            "h" | "help" | "?" => Ok(Command::Help),
            "q" | "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Why the command reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputExit {
    /// The operator asked to quit.
    Quit,
    /// Input closed (no terminal attached); keep running until a signal.
    Closed,
}

/// Runs one command and returns the operator-facing reply.
pub async fn execute<R: RemoteStore>(handle: &EngineHandle<R>, command: Command) -> String {
    match command {
        Command::Pause => match handle.pause().await {
            Ok(()) => "counting paused".to_string(),
            Err(err) => format!("pause: counts kept live, {err}"),
        },
        Command::Resume => {
            handle.resume().await;
            "counting resumed".to_string()
        }
        Command::Reset => {
            let discarded = handle.reset().await;
            format!("live count reset ({discarded} discarded)")
        }
        Command::Confirm => match handle.confirm().await {
            Ok(ConfirmOutcome::NothingToConfirm) => "nothing to confirm".to_string(),
            Ok(ConfirmOutcome::Confirmed { new_total }) => {
                format!("confirmed, new total {new_total}")
            }
            Ok(ConfirmOutcome::Queued { pending }) => {
                format!("offline, counts queued ({pending} pending upload)")
            }
            Err(err) => format!("confirm failed, counts unchanged: {err}"),
        },
        Command::Sync => match handle.sync_now().await {
            Ok(report) if report.online => format!(
                "synced, {} record(s) uploaded, {} pending",
                report.uploaded_records, report.pending
            ),
            Ok(report) => format!("offline, {} pending", report.pending),
            Err(err) => format!("sync failed: {err}"),
        },
        Command::Event => {
            if handle.record_event().await {
                "event recorded".to_string()
            } else {
                "paused, event ignored".to_string()
            }
        }
        Command::Help => HELP.to_string(),
        Command::Quit => "quitting".to_string(),
    }
}

/// Reads commands from `input` until quit or end of input.
pub async fn read_commands<R, I>(handle: &EngineHandle<R>, input: I) -> InputExit
where
    R: RemoteStore,
    I: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Operator input closed");
                return InputExit::Closed;
            }
            Err(err) => {
                warn!(error = %err, "Failed to read operator input");
                return InputExit::Closed;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                println!("{}", execute(handle, command).await);
                if command == Command::Quit {
                    return InputExit::Quit;
                }
            }
            Err(err) => println!("{err}; {HELP}"),
        }
    }
}
