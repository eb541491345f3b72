//! Configuration module for SCAMP
//!
//! Provides CLI arguments, runtime settings and the keyword
//! options accepted by the join facades.

mod options;
mod settings;

pub use options::*;
pub use settings::*;
