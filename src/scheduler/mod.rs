//! Scheduler module for the background probe loops.

mod connectivity;
mod monitor;
mod task;

pub use connectivity::*;
pub use monitor::*;
pub use task::*;
