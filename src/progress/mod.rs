//! Progress reporting module
//!
//! Provides progress visualization for local tile computations.

mod reporter;

pub use reporter::*;
