//! Error types for SCAMP
//!
//! This module defines the error taxonomy shared by the local engine,
//! the job coordinator and the client/worker transport.

use thiserror::Error;

/// Main error type for SCAMP operations
#[derive(Error, Debug)]
pub enum ScampError {
    /// Job specification or option rejected before any computation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A compute resource failed while processing a tile
    #[error("Resource fault on {resource}: {message}")]
    ResourceFault {
        /// Resource that faulted
        resource: String,
        /// Fault description
        message: String,
    },

    /// A tile exhausted its retry budget
    #[error("Computation failed on tile {tile} after {attempts} attempts: {last_error}")]
    ComputationFailure {
        /// Tile id in plan order
        tile: usize,
        /// Attempts made
        attempts: usize,
        /// Error of the last attempt
        last_error: String,
    },

    /// Transport failure between client/worker and coordinator
    #[error("Transport error with '{peer}': {message}")]
    Transport {
        /// Remote address
        peer: String,
        /// Failure description
        message: String,
    },

    /// A work range assignment expired without a report
    #[error("Work range {range} of job {job} timed out")]
    LivenessTimeout {
        /// Job id
        job: u64,
        /// Work range id
        range: usize,
    },

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(u64),

    /// Result requested before the job finished
    #[error("Job {job} is not finished (status: {status})")]
    JobNotFinished {
        /// Job id
        job: u64,
        /// Current status
        status: String,
    },

    /// Job reached the Failed state
    #[error("Job {job} failed: {reason}")]
    JobFailed {
        /// Job id
        job: u64,
        /// Failure reason
        reason: String,
    },

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: Box<ScampError>,
    },
}

impl ScampError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a resource fault
    pub fn resource_fault(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceFault {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ResourceFault { .. } | Self::Transport { .. } | Self::LivenessTimeout { .. } => {
                true
            }
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this error is a transient transport failure
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Io(_) => true,
            Self::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this error concerns a single job or work range rather
    /// than the connection to the coordinator
    pub fn is_job_scoped(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::JobNotFound(_)
            | Self::JobFailed { .. }
            | Self::InvalidState(_) => true,
            Self::WithContext { source, .. } => source.is_job_scoped(),
            _ => false,
        }
    }

    /// Check if this error was raised by input validation
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::WithContext { source, .. } => source.is_validation(),
            _ => false,
        }
    }
}

/// Result type alias for SCAMP operations
pub type Result<T> = std::result::Result<T, ScampError>;

impl From<serde_json::Error> for ScampError {
    fn from(err: serde_json::Error) -> Self {
        ScampError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ScampError {
    fn from(err: bincode::Error) -> Self {
        ScampError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        let recoverable = ScampError::resource_fault("gpu:0", "kernel launch failed");
        assert!(recoverable.is_recoverable());

        let timeout = ScampError::LivenessTimeout { job: 1, range: 0 };
        assert!(timeout.is_recoverable());

        let non_recoverable = ScampError::validation("window must be at least 2");
        assert!(!non_recoverable.is_recoverable());
        assert!(non_recoverable.is_validation());
    }

    #[test]
    fn test_transient_through_context() {
        let err = ScampError::transport("127.0.0.1:30078", "connection reset")
            .with_context("checking job status");
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("checking job status"));
    }

    #[test]
    fn test_job_scoped() {
        assert!(ScampError::JobNotFound(4).is_job_scoped());
        assert!(ScampError::invalid_state("running job has no accumulators")
            .with_context("reporting range 2")
            .is_job_scoped());
        assert!(!ScampError::transport("coordinator", "reset").is_job_scoped());
        assert!(!ScampError::Serialization("bad frame".to_string()).is_job_scoped());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ScampError = io_err.into();
        assert!(matches!(err, ScampError::Io(_)));
        assert!(err.is_transient());
    }
}
