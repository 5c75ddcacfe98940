//! Cluster module: merges local data with peer nodes.

mod service;
mod types;

pub use service::*;
pub use types::*;
