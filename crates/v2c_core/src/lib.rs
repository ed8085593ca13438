//! v2c core - task pipeline for video2commons
//!
//! This crate contains everything that turns a submitted conversion request
//! into a published media file, with zero front-end dependencies:
//!
//! - [`task`]: the per-task state machine with its status reporter,
//!   argument guard, stage memoization cache and resource scopes
//! - [`stages`]: the download / encode / upload / subtitle collaborators
//! - [`registry`]: durable task records, run locks, abort flags and the queue
//! - [`worker`]: the thread pool that pulls deliveries and runs tasks
//! - [`config`] and [`logging`]: the ambient settings and log plumbing

pub mod config;
pub mod logging;
pub mod models;
pub mod registry;
pub mod stages;
pub mod task;
pub mod worker;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
