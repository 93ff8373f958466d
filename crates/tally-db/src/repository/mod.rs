//! # Repository Module
//!
//! Database repository implementations for the local queue.
//!
//! ## Available Repositories
//!
//! - [`queue::CountQueueRepository`] - Parked counts awaiting upload

pub mod queue;
