//! Distributed job coordination
//!
//! A coordinator splits jobs into work ranges, workers compute them with
//! the local engine, and clients submit jobs and collect results, all over
//! a length-prefixed bincode protocol on TCP.

mod client;
mod coordinator;
pub mod protocol;
mod server;
mod worker;

pub use client::*;
pub use coordinator::*;
pub use protocol::WireError;
pub use server::*;
pub use worker::*;
