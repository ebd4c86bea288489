//! Windowed aggregation of raw metrics into period aggregates.

mod engine;
mod period;

pub use engine::*;
pub use period::*;
