//! Storage module for JobMonitor.
//!
//! Append-only JSON history files with atomic replace-on-write.

mod models;
mod store;

pub use models::*;
pub use store::*;
