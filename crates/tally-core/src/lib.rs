//! # tally-core: Pure Counting Logic for Tally
//!
//! This crate holds the parts of the count-reconciliation engine that do
//! not touch a database, a network, or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              apps/tally-edge (sensor, display, input)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            tally-sync (engine, reconcile, confirm)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐                  │   │
//! │  │   │   types   │  │ counting  │  │   edge    │                  │   │
//! │  │   │CountRecord│  │CountState │  │EdgeDetect │                  │   │
//! │  │   │SystemState│  │ staging   │  │SensorSrc  │                  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘                  │   │
//! │  │                                                                 │   │
//! │  │   NO DATABASE • NO NETWORK • NO ASYNC                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, snapshots and connection status
//! - [`counting`] - `CountState`, the single owner of every counter
//! - [`edge`] - Edge detection over a sampled binary input
//! - [`error`] - Sensor error type
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use tally_core::{ConnectionStatus, CountState};
//!
//! let mut counts = CountState::new();
//! counts.on_event(Utc::now());
//! counts.on_event(Utc::now());
//!
//! let snapshot = counts.snapshot(ConnectionStatus::Disconnected);
//! assert_eq!(snapshot.live_count, 2);
//! assert_eq!(snapshot.total_unconfirmed(), 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod counting;
pub mod edge;
pub mod error;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use counting::{CountState, StagedUpload};
pub use edge::{Edge, EdgeDetector, Event, SensorSource};
pub use error::SensorError;
pub use types::*;
