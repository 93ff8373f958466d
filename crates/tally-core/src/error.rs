//! # Error Types
//!
//! Errors raised at the sensor boundary.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core (this file)                                                │
//! │  └── SensorError      - One failed sample (transient)                  │
//! │                                                                         │
//! │  tally-db                                                              │
//! │  └── DbError          - Local durable queue failures                   │
//! │                                                                         │
//! │  tally-sync                                                            │
//! │  └── SyncError        - Remote, timeout, and workflow failures         │
//! │                                                                         │
//! │  Flow: DbError → SyncError → operator / logs                           │
//! │        SensorError → logged, sample skipped                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// A failed read of the binary sensor input.
///
/// Always transient: the sampler skips the sample and tries again on the
/// next tick. A sensor error never produces a count.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The input could not be read (I/O failure, device busy).
    #[error("Sensor read failed: {0}")]
    ReadFailed(String),

    /// The input returned something that is not a binary level.
    #[error("Unexpected sensor value: '{0}'")]
    InvalidValue(String),

    /// The input has not been set up (or was already released).
    #[error("Sensor not initialized: {0}")]
    NotInitialized(String),
}

impl From<std::io::Error> for SensorError {
    fn from(err: std::io::Error) -> Self {
        SensorError::ReadFailed(err.to_string())
    }
}
