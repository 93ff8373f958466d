//! # tally-sync: Reconciliation Engine for Tally
//!
//! Keeps a device's part counts consistent with the remote production
//! store across outages, restarts and operator confirmations.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Engine Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  Engine (engine.rs)                              │  │
//! │  │  Spawns sampler / reconciler / publisher; EngineHandle for the   │  │
//! │  │  operator: pause, resume, reset, confirm, sync_now, snapshot     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ reconcile.rs   │  │ connection.rs  │  │ confirm.rs             │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Refresh counts │  │ Status owner,  │  │ Fold live into the     │    │
//! │  │ Drain queue    │  │ backoff 30s →  │  │ confirmed total, or    │    │
//! │  │ Prune uploads  │  │ 300s           │  │ park it offline        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  remote/  RemoteStore trait: MySqlRemote, MemoryRemote          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] - TOML + environment configuration
//! - [`connection`] - Connection status and reconnect backoff
//! - [`remote`] - Remote store trait and implementations
//! - [`engine`] - Tasks, shared state and the operator handle
//! - [`error`] - Sync error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod confirm;
pub mod connection;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::TallyConfig;
pub use confirm::ConfirmOutcome;
pub use connection::ConnectionManager;
pub use engine::{Engine, EngineHandle, NoOpSink, RunningEngine, StatusSink};
pub use error::{SyncError, SyncResult};
pub use reconcile::TickReport;
pub use remote::{CountUpload, MemoryRemote, MySqlRemote, RemoteStore};
