//! Coordinator TCP server
//!
//! Serves the job protocol for clients and workers:
//!
//! ```bash
//! # Start a coordinator on the default port
//! scamp server
//!
//! # Smaller work ranges, faster reclaim
//! scamp server --range-size 65536 --liveness-timeout 2m
//! ```

use super::protocol::{read_frame, read_magic, write_frame, Request, Response, PROTOCOL_VERSION};
use super::JobCoordinator;
use crate::config::CoordinatorConfig;
use crate::error::{Result, ScampError};
use chrono::Utc;
use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often archived jobs are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Coordinator server
pub struct CoordinatorServer {
    /// Job state
    coordinator: Arc<JobCoordinator>,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

impl CoordinatorServer {
    /// Create a server with a fresh coordinator
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_coordinator(Arc::new(JobCoordinator::new(config)))
    }

    /// Serve an existing coordinator
    pub fn with_coordinator(coordinator: Arc<JobCoordinator>) -> Self {
        Self {
            coordinator,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown flag for external control
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Shared coordinator
    pub fn coordinator(&self) -> Arc<JobCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Bind the configured address
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.coordinator.config().address();
        TcpListener::bind(&addr).map_err(|e| ScampError::transport(&addr, e.to_string()))
    }

    /// Run the server (blocking)
    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener)
    }

    /// Accept connections on `listener` until shutdown
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "coordinator".to_string());
        listener
            .set_nonblocking(true)
            .map_err(|e| ScampError::transport(&addr, e.to_string()))?;

        info!("SCAMP coordinator listening on {}", addr);
        let mut last_purge = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let coordinator = Arc::clone(&self.coordinator);
                    debug!("Accepted connection from {}", peer);

                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &coordinator) {
                            warn!("Connection error with {}: {}", peer, e);
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }

            if last_purge.elapsed() >= PURGE_INTERVAL {
                last_purge = Instant::now();
                if let Err(e) = self.coordinator.purge_archived(Utc::now()) {
                    warn!("Purge failed: {}", e);
                }
            }
        }

        info!("Coordinator shutting down");
        Ok(())
    }
}

/// Handle a single client or worker connection
fn handle_connection(stream: TcpStream, coordinator: &JobCoordinator) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_nodelay(true))
        .map_err(|e| ScampError::transport(&peer, e.to_string()))?;

    let read_half = stream
        .try_clone()
        .map_err(|e| ScampError::transport(&peer, e.to_string()))?;
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(stream);

    read_magic(&mut reader, &peer)?;
    let mut handshaken = false;

    while let Some(request) = read_frame::<_, Request>(&mut reader, &peer)? {
        let response = match request {
            Request::Handshake { version, role } => {
                if version != PROTOCOL_VERSION {
                    Response::error(&ScampError::validation(format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, version
                    )))
                } else {
                    debug!("Handshake from {} ({})", peer, role);
                    handshaken = true;
                    Response::HandshakeOk {
                        version: PROTOCOL_VERSION,
                    }
                }
            }
            _ if !handshaken => Response::error(&ScampError::invalid_state("handshake required")),
            request => handle_request(coordinator, request),
        };
        write_frame(&mut writer, &peer, &response)?;
    }

    debug!("Connection from {} closed", peer);
    Ok(())
}

/// Answer one request against `coordinator`
pub fn handle_request(coordinator: &JobCoordinator, request: Request) -> Response {
    let result = match request {
        Request::Handshake { .. } => Ok(Response::HandshakeOk {
            version: PROTOCOL_VERSION,
        }),
        Request::IssueNewJob { spec } => coordinator
            .submit(*spec)
            .map(|job_id| Response::JobIssued { job_id }),
        Request::CheckJobStatus { job_id } => coordinator
            .status(job_id)
            .map(|status| Response::Status { status }),
        Request::FetchJobResult { job_id } => coordinator
            .fetch_result(job_id)
            .map(|spec| Response::JobResult { spec: Box::new(spec) }),
        Request::ListJobs => coordinator.list_jobs().map(|jobs| Response::Jobs { jobs }),
        Request::RequestWork { worker } => coordinator
            .assign_next_work_range(&worker)
            .map(|assignment| Response::Work {
                assignment: assignment.map(Box::new),
            }),
        Request::ReportWorkResult {
            job_id,
            range,
            worker,
            rows,
            cols,
        } => coordinator
            .report_work_range_result(job_id, range, &worker, rows, cols)
            .map(|merged| Response::ResultAccepted { merged }),
        Request::ReportWorkFailure {
            job_id,
            range,
            worker,
            reason,
        } => coordinator
            .report_work_range_failure(job_id, range, &worker, &reason)
            .map(|_| Response::FailureRecorded),
        Request::Ping => Ok(Response::Pong),
    };

    result.unwrap_or_else(|e| Response::error(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobSpec;
    use crate::distributed::{JobStatus, WireError};

    #[test]
    fn test_handle_request_round() {
        let coordinator = JobCoordinator::default();
        let spec = JobSpec::self_join((0..120).map(|i| (i as f64 * 0.3).sin()).collect(), 8);

        let job_id = match handle_request(&coordinator, Request::IssueNewJob { spec: Box::new(spec) }) {
            Response::JobIssued { job_id } => job_id,
            other => panic!("unexpected response: {:?}", other),
        };

        match handle_request(&coordinator, Request::CheckJobStatus { job_id }) {
            Response::Status { status } => assert!(matches!(status, JobStatus::Running { .. })),
            other => panic!("unexpected response: {:?}", other),
        }

        // Not ready yet
        match handle_request(&coordinator, Request::FetchJobResult { job_id }) {
            Response::Error {
                error: WireError::JobNotFinished { job, .. },
            } => assert_eq!(job, job_id),
            other => panic!("unexpected response: {:?}", other),
        }

        assert!(matches!(handle_request(&coordinator, Request::Ping), Response::Pong));
    }

    #[test]
    fn test_invalid_job_reported_as_validation() {
        let coordinator = JobCoordinator::default();
        let spec = JobSpec::self_join(vec![0.0; 4], 1);
        match handle_request(&coordinator, Request::IssueNewJob { spec: Box::new(spec) }) {
            Response::Error {
                error: WireError::Validation(_),
            } => {}
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(coordinator.list_jobs().unwrap().is_empty());
    }
}
