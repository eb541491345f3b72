//! # SCAMP - Scalable Matrix Profile Computation
//!
//! SCAMP computes the matrix profile of time series: for every subsequence
//! of length `m`, the Pearson correlation (or z-normalized Euclidean
//! distance) to its best matches elsewhere in the same series (self-join)
//! or in a second series (AB-join).
//!
//! ## Features
//!
//! - **Tiled Computation**: The distance matrix is split into tiles computed
//!   independently and merged through associative accumulators
//! - **Multiple Statistics**: Nearest neighbor, k nearest neighbors,
//!   thresholded correlation sums, and pooled matrix summaries
//! - **Heterogeneous Resources**: CPU worker groups and pluggable device
//!   backends with per-tile fault retry
//! - **Precision Policies**: Double, mixed (single with double confirmation)
//!   and single precision kernels
//! - **Distributed Jobs**: A coordinator splits jobs into work ranges for a
//!   fleet of workers; clients submit, poll and fetch over TCP
//!
//! ## Quick Start
//!
//! ```no_run
//! use scamp::config::{ComputeOptions, ProfileType};
//! use scamp::core::self_join;
//! use scamp::profile::ProfileOutput;
//!
//! let series: Vec<f64> = (0..10_000).map(|i| (i as f64 * 0.01).sin()).collect();
//! let output = self_join(&series, 100, ProfileType::NearestNeighbor, &ComputeOptions::default()).unwrap();
//!
//! if let ProfileOutput::NearestNeighbor { values, indices } = output {
//!     println!("first match: {} at {}", values[0], indices[0]);
//! }
//! ```
//!
//! ## Engine Usage
//!
//! ```no_run
//! use scamp::config::EngineConfig;
//! use scamp::core::{JobSpec, Precision, ScampEngine};
//! use scamp::profile::ProfileKind;
//! use scamp::progress::ProgressReporter;
//!
//! let a: Vec<f64> = (0..50_000).map(|i| (i as f64 * 0.003).cos()).collect();
//! let spec = JobSpec::self_join(a, 256)
//!     .with_kind(ProfileKind::KNearest { k: 5 })
//!     .with_precision(Precision::Mixed);
//!
//! let engine = ScampEngine::new(EngineConfig { threads: 8, ..Default::default() })
//!     .with_progress(ProgressReporter::new());
//! let result = engine.compute(&spec).unwrap();
//! assert!(result.profile_rows.is_some());
//! ```
//!
//! ## Distributed Jobs
//!
//! ```no_run
//! use scamp::config::ClientConfig;
//! use scamp::core::JobSpec;
//! use scamp::distributed::{JobClient, RemoteJobService};
//!
//! let config = ClientConfig::default();
//! let client = JobClient::new(RemoteJobService::new("coordinator:30078", &config), config);
//!
//! let a: Vec<f64> = (0..1_000_000).map(|i| (i as f64 * 0.001).sin()).collect();
//! let result = client.run(&JobSpec::self_join(a, 1000)).unwrap();
//! println!("{} rows", result.profile_rows.map(|p| p.len()).unwrap_or(0));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod distributed;
pub mod error;
pub mod profile;
pub mod progress;

// Re-export commonly used types
pub use config::{ComputeOptions, OptionValue, ProfileType};
pub use core::{ab_join, self_join, JobSpec, Precision, ScampEngine};
pub use error::{Result, ScampError};
pub use profile::{ProfileAccumulator, ProfileKind, ProfileOutput};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use scamp::prelude::*;
    //! ```

    pub use crate::config::{ComputeOptions, EngineConfig, OptionValue, ProfileType};
    pub use crate::core::{ab_join, self_join, JobSpec, Precision, ProfileSet, ScampEngine};
    pub use crate::distributed::{JobClient, JobCoordinator, JobService, JobStatus, RemoteJobService, Worker};
    pub use crate::error::{Result, ScampError};
    pub use crate::profile::{ProfileAccumulator, ProfileKind, ProfileOutput};
    pub use crate::progress::ProgressReporter;
}
