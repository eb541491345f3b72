//! Matrix profile results
//!
//! Provides the mergeable profile accumulators and their conversion
//! into user-facing output shapes.

mod accumulator;
mod output;

pub use accumulator::*;
pub use output::*;
