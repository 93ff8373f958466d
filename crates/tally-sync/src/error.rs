//! # Sync Error Types
//!
//! Error types for remote calls and the reconciliation workflows.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Connectivity   │  │     Remote data         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RemoteConnect  │  │  RemoteQuery            │ │
//! │  │  MissingHeadName│  │  Timeout        │  │  RemoteWrite            │ │
//! │  │  InvalidUrl     │  │  NotConnected   │  │  UnknownHead            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │  Local store    │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  LocalStore     │  │  ShuttingDown   │                              │
//! │  │  (DbError)      │  │  Internal       │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! │                                                                         │
//! │  Connectivity errors drive the connection manager into backoff.        │
//! │  Everything else is reported and retried on the next tick or by the    │
//! │  operator.                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Every failure the engine can report.
///
/// No variant implies a count was lost: on any error the caller's
/// counters are left as they were.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The production line name is not configured.
    #[error("Line head name not configured. Set [line] head_name or TALLY_HEAD_NAME.")]
    MissingHeadName,

    /// Invalid or missing remote URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// Could not reach the remote store, or the link dropped mid-call.
    #[error("Remote connection failed: {0}")]
    RemoteConnect(String),

    /// A remote call did not finish in time.
    #[error("Remote {operation} timed out after {secs} seconds")]
    Timeout { operation: &'static str, secs: u64 },

    /// A remote call was attempted without a connection.
    #[error("Not connected to the remote store")]
    NotConnected,

    // =========================================================================
    // Remote Data Errors
    // =========================================================================
    /// A read against the remote store failed.
    #[error("Remote query failed: {0}")]
    RemoteQuery(String),

    /// A write against the remote store failed and was rolled back.
    #[error("Remote write failed: {0}")]
    RemoteWrite(String),

    /// The remote store has no line with this name.
    #[error("Unknown line head: {0}")]
    UnknownHead(String),

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// The local durable queue failed.
    #[error("Local store error: {0}")]
    LocalStore(#[from] DbError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The engine is stopping and refuses new work.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

/// Returns true if a sqlx error means the link to the server is gone.
pub(crate) fn is_link_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_)
    )
}

impl SyncError {
    /// Maps a failed remote read, keeping link failures distinct.
    pub(crate) fn query(err: sqlx::Error) -> Self {
        if is_link_failure(&err) {
            SyncError::RemoteConnect(err.to_string())
        } else {
            SyncError::RemoteQuery(err.to_string())
        }
    }

    /// Maps a failed remote write, keeping link failures distinct.
    pub(crate) fn write(err: sqlx::Error) -> Self {
        if is_link_failure(&err) {
            SyncError::RemoteConnect(err.to_string())
        } else {
            SyncError::RemoteWrite(err.to_string())
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the connection to the remote store should be
    /// considered lost.
    ///
    /// ## Connection-loss Errors
    /// - Connect and transport failures
    /// - Timeouts
    /// - Calls made while not connected
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteConnect(_) | SyncError::Timeout { .. } | SyncError::NotConnected
        )
    }

    /// Returns true if repeating the operation later may succeed.
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Unknown line head
    /// - Shutdown and internal errors
    pub fn is_retryable(&self) -> bool {
        self.is_connection_loss()
            || matches!(
                self,
                SyncError::RemoteQuery(_) | SyncError::RemoteWrite(_) | SyncError::LocalStore(_)
            )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingHeadName
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
