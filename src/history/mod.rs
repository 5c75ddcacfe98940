//! History views: entity discovery and bucketed timelines.

mod catalog;
mod timeline;

pub use catalog::*;
pub use timeline::*;
