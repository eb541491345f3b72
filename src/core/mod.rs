//! Core matrix profile engine
//!
//! Job specifications, tile planning, the diagonal correlation kernel,
//! resource dispatching and the local engine that ties them together.

mod dispatcher;
mod engine;
mod kernel;
mod spec;
mod tiling;

pub use dispatcher::*;
pub use engine::*;
pub use kernel::*;
pub use spec::*;
pub use tiling::*;
