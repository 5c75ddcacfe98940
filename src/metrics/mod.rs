//! Aggregate statistics computed from stored history.

mod uptime;

pub use uptime::*;
