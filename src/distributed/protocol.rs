//! Coordinator wire protocol
//!
//! Every connection starts with the 8-byte magic, followed by a
//! `Handshake` request. Messages are framed as a little-endian `u32`
//! length followed by a bincode body:
//!
//! ```text
//! +----------+-----------+------------------+
//! | SCAMPRS1 | len (u32) | bincode(message) | ...
//! +----------+-----------+------------------+
//! ```

use super::{JobStatus, JobSummary, WorkAssignment};
use crate::core::JobSpec;
use crate::error::{Result, ScampError};
use crate::profile::ProfileAccumulator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for protocol identification
pub const PROTOCOL_MAGIC: &[u8; 8] = b"SCAMPRS1";

/// Maximum frame size (1 GiB); results of long series are large
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Request sent to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Protocol handshake
    Handshake {
        /// Client protocol version
        version: u32,
        /// Client role ("client" or "worker")
        role: String,
    },

    /// Submit a job
    IssueNewJob {
        /// Job to run
        spec: Box<JobSpec>,
    },

    /// Query job status
    CheckJobStatus {
        /// Job id
        job_id: u64,
    },

    /// Fetch the result of a finished job
    FetchJobResult {
        /// Job id
        job_id: u64,
    },

    /// List known jobs
    ListJobs,

    /// Ask for a work range
    RequestWork {
        /// Worker identifier
        worker: String,
    },

    /// Report the partials of a finished work range
    ReportWorkResult {
        /// Job id
        job_id: u64,
        /// Work range id
        range: usize,
        /// Worker identifier
        worker: String,
        /// Row partial
        rows: Option<ProfileAccumulator>,
        /// Column partial
        cols: Option<ProfileAccumulator>,
    },

    /// Report that a work range could not be computed
    ReportWorkFailure {
        /// Job id
        job_id: u64,
        /// Work range id
        range: usize,
        /// Worker identifier
        worker: String,
        /// Failure description
        reason: String,
    },

    /// Keepalive
    Ping,
}

/// Errors carried back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    /// Rejected input
    Validation(String),
    /// Unknown job id
    JobNotFound(u64),
    /// Result requested before the job finished
    JobNotFinished {
        /// Job id
        job: u64,
        /// Current status
        status: String,
    },
    /// Job failed
    JobFailed {
        /// Job id
        job: u64,
        /// Failure reason
        reason: String,
    },
    /// Any other coordinator-side error
    Other(String),
}

impl From<&ScampError> for WireError {
    fn from(err: &ScampError) -> Self {
        match err {
            ScampError::Validation(msg) => WireError::Validation(msg.clone()),
            ScampError::JobNotFound(job) => WireError::JobNotFound(*job),
            ScampError::JobNotFinished { job, status } => WireError::JobNotFinished {
                job: *job,
                status: status.clone(),
            },
            ScampError::JobFailed { job, reason } => WireError::JobFailed {
                job: *job,
                reason: reason.clone(),
            },
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for ScampError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Validation(msg) => ScampError::Validation(msg),
            WireError::JobNotFound(job) => ScampError::JobNotFound(job),
            WireError::JobNotFinished { job, status } => ScampError::JobNotFinished { job, status },
            WireError::JobFailed { job, reason } => ScampError::JobFailed { job, reason },
            WireError::Other(msg) => ScampError::invalid_state(format!("coordinator: {}", msg)),
        }
    }
}

/// Coordinator response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Handshake accepted
    HandshakeOk {
        /// Server protocol version
        version: u32,
    },

    /// Job accepted
    JobIssued {
        /// Assigned id
        job_id: u64,
    },

    /// Job status
    Status {
        /// Current status
        status: JobStatus,
    },

    /// Finished job with populated profiles
    JobResult {
        /// Job spec carrying the result
        spec: Box<JobSpec>,
    },

    /// Job listing
    Jobs {
        /// Summaries, oldest first
        jobs: Vec<JobSummary>,
    },

    /// Work assignment (None when nothing is pending)
    Work {
        /// Assigned range
        assignment: Option<Box<WorkAssignment>>,
    },

    /// Work result processed
    ResultAccepted {
        /// Whether the partial was combined (false for duplicates)
        merged: bool,
    },

    /// Work failure recorded
    FailureRecorded,

    /// Pong response
    Pong,

    /// Error response
    Error {
        /// Error details
        error: WireError,
    },
}

impl Response {
    /// Error response for `err`
    pub fn error(err: &ScampError) -> Self {
        Response::Error { error: err.into() }
    }
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, peer: &str, message: &T) -> Result<()> {
    let msg = bincode::serialize(message)?;
    if msg.len() > MAX_MESSAGE_SIZE {
        return Err(ScampError::transport(
            peer,
            format!("Message too large: {} bytes", msg.len()),
        ));
    }

    let len = (msg.len() as u32).to_le_bytes();
    writer
        .write_all(&len)
        .and_then(|_| writer.write_all(&msg))
        .and_then(|_| writer.flush())
        .map_err(|e| ScampError::transport(peer, e.to_string()))
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean end of
/// stream before the length prefix.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, peer: &str) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ScampError::transport(peer, e.to_string())),
    }

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(ScampError::transport(
            peer,
            format!("Message too large: {} bytes", msg_len),
        ));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader
        .read_exact(&mut msg_buf)
        .map_err(|e| ScampError::transport(peer, e.to_string()))?;

    let message = bincode::deserialize(&msg_buf)
        .map_err(|e| ScampError::transport(peer, format!("malformed frame: {}", e)))?;
    Ok(Some(message))
}

/// Read and check the connection magic
pub fn read_magic<R: Read>(reader: &mut R, peer: &str) -> Result<()> {
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|e| ScampError::transport(peer, e.to_string()))?;

    if &magic != PROTOCOL_MAGIC {
        return Err(ScampError::transport(peer, "Invalid protocol magic bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "test", &Request::Ping).unwrap();
        write_frame(&mut buf, "test", &Request::CheckJobStatus { job_id: 7 }).unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor, "test").unwrap(), Some(Request::Ping)));
        assert!(matches!(
            read_frame(&mut cursor, "test").unwrap(),
            Some(Request::CheckJobStatus { job_id: 7 })
        ));
        assert!(read_frame::<_, Request>(&mut cursor, "test").unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = read_frame::<_, Request>(&mut Cursor::new(buf), "peer").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_truncated_frame_is_transport_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "test", &Request::ListJobs).unwrap();
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buf);
        assert!(read_frame::<_, Request>(&mut cursor, "test").unwrap().is_some());
        assert!(matches!(
            read_frame::<_, Request>(&mut cursor, "test"),
            Err(ScampError::Transport { .. })
        ));
    }

    #[test]
    fn test_magic_checked() {
        assert!(read_magic(&mut Cursor::new(PROTOCOL_MAGIC.to_vec()), "p").is_ok());
        assert!(read_magic(&mut Cursor::new(b"SCAGENT1".to_vec()), "p").is_err());
    }

    #[test]
    fn test_wire_errors_preserve_kind() {
        let err = ScampError::JobNotFinished {
            job: 3,
            status: "running".into(),
        };
        let back: ScampError = WireError::from(&err).into();
        assert!(matches!(back, ScampError::JobNotFinished { job: 3, .. }));

        let back: ScampError = WireError::from(&ScampError::validation("bad window")).into();
        assert!(back.is_validation());
    }
}
