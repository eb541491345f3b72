//! Job client
//!
//! Submits jobs to a coordinator, polls them to completion and fetches the
//! result. The coordinator is reached through [`JobService`], either
//! in-process or over TCP with [`RemoteJobService`].

use super::protocol::{read_frame, write_frame, Request, Response, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use super::{JobCoordinator, JobStatus, JobSummary};
use crate::config::ClientConfig;
use crate::core::JobSpec;
use crate::error::{Result, ScampError};
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Job-level coordinator operations
pub trait JobService {
    /// Submit a job; returns its id
    fn issue_new_job(&self, spec: &JobSpec) -> Result<u64>;

    /// Current status of a job
    fn check_job_status(&self, job_id: u64) -> Result<JobStatus>;

    /// Finished job with populated profiles
    fn fetch_job_result(&self, job_id: u64) -> Result<JobSpec>;

    /// All jobs known to the coordinator
    fn list_jobs(&self) -> Result<Vec<JobSummary>>;
}

impl JobService for JobCoordinator {
    fn issue_new_job(&self, spec: &JobSpec) -> Result<u64> {
        self.submit(spec.clone())
    }

    fn check_job_status(&self, job_id: u64) -> Result<JobStatus> {
        self.status(job_id)
    }

    fn fetch_job_result(&self, job_id: u64) -> Result<JobSpec> {
        self.fetch_result(job_id)
    }

    fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        JobCoordinator::list_jobs(self)
    }
}

impl<S: JobService + ?Sized> JobService for Arc<S> {
    fn issue_new_job(&self, spec: &JobSpec) -> Result<u64> {
        (**self).issue_new_job(spec)
    }

    fn check_job_status(&self, job_id: u64) -> Result<JobStatus> {
        (**self).check_job_status(job_id)
    }

    fn fetch_job_result(&self, job_id: u64) -> Result<JobSpec> {
        (**self).fetch_job_result(job_id)
    }

    fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        (**self).list_jobs()
    }
}

/// An open, handshaken coordinator connection
struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

/// Coordinator reached over TCP.
///
/// The connection is opened lazily and dropped after any transport error;
/// the next call reconnects.
pub struct RemoteJobService {
    address: String,
    role: String,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl RemoteJobService {
    /// Service for the coordinator at `address` (`host:port`)
    pub fn new(address: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            address: address.into(),
            role: "client".to_string(),
            connect_timeout: config.connect_timeout,
            connection: Mutex::new(None),
        }
    }

    /// Identify as a worker in the handshake
    pub fn as_worker(mut self) -> Self {
        self.role = "worker".to_string();
        self
    }

    /// Coordinator address
    pub fn address(&self) -> &str {
        &self.address
    }

    fn transport_error(&self, message: impl Into<String>) -> ScampError {
        ScampError::transport(&self.address, message)
    }

    fn open(&self) -> Result<Connection> {
        let addr = self
            .address
            .to_socket_addrs()
            .map_err(|e| self.transport_error(e.to_string()))?
            .next()
            .ok_or_else(|| self.transport_error("address did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| self.transport_error(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.transport_error(e.to_string()))?;
        let read_half = stream
            .try_clone()
            .map_err(|e| self.transport_error(e.to_string()))?;

        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(stream),
        };
        conn.writer
            .write_all(PROTOCOL_MAGIC)
            .map_err(|e| self.transport_error(e.to_string()))?;

        let handshake = Request::Handshake {
            version: PROTOCOL_VERSION,
            role: self.role.clone(),
        };
        match self.exchange(&mut conn, &handshake)? {
            Response::HandshakeOk { version } if version == PROTOCOL_VERSION => {
                debug!("Connected to coordinator {}", self.address);
                Ok(conn)
            }
            Response::HandshakeOk { version } => Err(self.transport_error(format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, version
            ))),
            Response::Error { error } => Err(error.into()),
            other => Err(self.transport_error(format!("Unexpected handshake response: {:?}", other))),
        }
    }

    fn exchange(&self, conn: &mut Connection, request: &Request) -> Result<Response> {
        write_frame(&mut conn.writer, &self.address, request)?;
        read_frame(&mut conn.reader, &self.address)?
            .ok_or_else(|| self.transport_error("connection closed by coordinator"))
    }

    /// Send a request and receive its response; coordinator-side errors are
    /// returned as `Err`
    pub fn call(&self, request: &Request) -> Result<Response> {
        let mut slot = self
            .connection
            .lock()
            .map_err(|_| ScampError::invalid_state("connection lock poisoned"))?;

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.open()?,
        };

        // Keep the connection only if the exchange completed
        let response = self.exchange(&mut conn, request)?;
        *slot = Some(conn);

        match response {
            Response::Error { error } => Err(error.into()),
            response => Ok(response),
        }
    }

    /// Round trip a keepalive
    pub fn ping(&self) -> Result<()> {
        match self.call(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

pub(crate) fn unexpected(response: Response) -> ScampError {
    ScampError::invalid_state(format!("unexpected coordinator response: {:?}", response))
}

impl JobService for RemoteJobService {
    fn issue_new_job(&self, spec: &JobSpec) -> Result<u64> {
        let request = Request::IssueNewJob {
            spec: Box::new(spec.clone()),
        };
        match self.call(&request)? {
            Response::JobIssued { job_id } => Ok(job_id),
            other => Err(unexpected(other)),
        }
    }

    fn check_job_status(&self, job_id: u64) -> Result<JobStatus> {
        match self.call(&Request::CheckJobStatus { job_id })? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn fetch_job_result(&self, job_id: u64) -> Result<JobSpec> {
        match self.call(&Request::FetchJobResult { job_id })? {
            Response::JobResult { spec } => Ok(*spec),
            other => Err(unexpected(other)),
        }
    }

    fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        match self.call(&Request::ListJobs)? {
            Response::Jobs { jobs } => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }
}

/// Blocking job client
pub struct JobClient<S> {
    service: S,
    config: ClientConfig,
}

impl<S: JobService> JobClient<S> {
    /// Create a client over `service`
    pub fn new(service: S, config: ClientConfig) -> Self {
        Self { service, config }
    }

    /// Underlying service
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Submit a job. Transport errors are returned, not retried.
    pub fn submit(&self, spec: &JobSpec) -> Result<u64> {
        let job_id = self.service.issue_new_job(spec)?;
        info!("Submitted job {} ({})", job_id, spec.describe());
        Ok(job_id)
    }

    /// Wait until the job finishes. Transport errors are logged and retried.
    pub fn poll(&self, job_id: u64) -> Result<()> {
        loop {
            thread::sleep(self.config.poll_interval);
            match self.service.check_job_status(job_id) {
                Ok(JobStatus::Finished) => return Ok(()),
                Ok(JobStatus::Failed { reason }) => return Err(ScampError::JobFailed { job: job_id, reason }),
                Ok(status) => debug!("Job {}: {}", job_id, status),
                Err(e) if e.is_transient() => warn!("Status check for job {} failed: {}; retrying", job_id, e),
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch the result of a finished job, retrying transport errors and
    /// not-ready answers
    pub fn fetch(&self, job_id: u64) -> Result<JobSpec> {
        loop {
            match self.service.fetch_job_result(job_id) {
                Ok(result) => return Ok(result),
                Err(e @ ScampError::JobNotFinished { .. }) => debug!("{}; waiting", e),
                Err(e) if e.is_transient() => warn!("Fetching job {} failed: {}; retrying", job_id, e),
                Err(e) => return Err(e),
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Submit, wait and fetch
    pub fn run(&self, spec: &JobSpec) -> Result<JobSpec> {
        let job_id = self.submit(spec)?;
        self.poll(job_id)?;
        let result = self.fetch(job_id)?;
        info!("Job {} complete", job_id);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, EngineConfig, WorkerConfig};
    use crate::distributed::{CoordinatorServer, Worker};
    use crate::profile::ProfileData;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn series(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i as f64) * 0.19).sin() + ((i * 7) % 3) as f64 * 0.2).collect()
    }

    fn fast() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Service failing every other status check with a transport error
    struct FlakyService {
        inner: Arc<JobCoordinator>,
        calls: AtomicUsize,
    }

    impl JobService for FlakyService {
        fn issue_new_job(&self, spec: &JobSpec) -> Result<u64> {
            self.inner.issue_new_job(spec)
        }

        fn check_job_status(&self, job_id: u64) -> Result<JobStatus> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(ScampError::transport("flaky", "connection reset"));
            }
            self.inner.check_job_status(job_id)
        }

        fn fetch_job_result(&self, job_id: u64) -> Result<JobSpec> {
            self.inner.fetch_job_result(job_id)
        }

        fn list_jobs(&self) -> Result<Vec<JobSummary>> {
            self.inner.list_jobs()
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "test-worker".to_string(),
            idle_backoff: Duration::from_millis(5),
            engine: EngineConfig {
                threads: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_poll_retries_transport_errors() {
        let coordinator = Arc::new(JobCoordinator::new(CoordinatorConfig {
            range_size: 64,
            ..Default::default()
        }));
        let client = JobClient::new(
            FlakyService {
                inner: Arc::clone(&coordinator),
                calls: AtomicUsize::new(0),
            },
            fast(),
        );
        let job_id = client.submit(&JobSpec::self_join(series(150), 8)).unwrap();

        let worker = Worker::new(Arc::clone(&coordinator), worker_config());
        while worker.run_once().unwrap() {}

        client.poll(job_id).unwrap();
        let result = client.fetch(job_id).unwrap();
        assert!(result.profile_rows.is_some());
        assert!(client.service().calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_poll_reports_failed_job() {
        let coordinator = Arc::new(JobCoordinator::new(CoordinatorConfig {
            range_size: 1024,
            max_range_attempts: 1,
            ..Default::default()
        }));
        let client = JobClient::new(Arc::clone(&coordinator), fast());
        let job_id = client.submit(&JobSpec::self_join(series(100), 8)).unwrap();

        let work = coordinator.assign_next_work_range("w").unwrap().unwrap();
        coordinator
            .report_work_range_failure(job_id, work.range, "w", "out of memory")
            .unwrap();

        match client.poll(job_id) {
            Err(ScampError::JobFailed { job, reason }) => {
                assert_eq!(job, job_id);
                assert!(reason.contains("out of memory"));
            }
            other => panic!("unexpected poll outcome: {:?}", other),
        }
    }

    #[test]
    fn test_submit_propagates_transport_error() {
        // Nothing listens on this port once the listener is dropped
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let client = JobClient::new(RemoteJobService::new(format!("127.0.0.1:{}", port), &fast()), fast());
        let err = client.submit(&JobSpec::self_join(series(50), 8)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_tcp_end_to_end() {
        let coordinator = Arc::new(JobCoordinator::new(CoordinatorConfig {
            range_size: 64,
            ..Default::default()
        }));
        let server = CoordinatorServer::with_coordinator(Arc::clone(&coordinator));
        let shutdown = server.shutdown_flag();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server_thread = thread::spawn(move || server.serve(listener));

        let worker_stop = Arc::new(AtomicBool::new(false));
        let worker_thread = {
            let address = address.clone();
            let stop = Arc::clone(&worker_stop);
            thread::spawn(move || {
                let source = RemoteJobService::new(address, &fast()).as_worker();
                Worker::new(source, worker_config()).run_until(&stop)
            })
        };

        let spec = JobSpec::ab_join(series(180), series(140), 10);
        let client = JobClient::new(RemoteJobService::new(address.clone(), &fast()), fast());
        client.service().ping().unwrap();
        let result = client.run(&spec).unwrap();

        let jobs = client.service().list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].fetched_at.is_some());

        worker_stop.store(true, Ordering::SeqCst);
        let stats = worker_thread.join().unwrap().unwrap();
        // 171 rows x 131 columns in 64-wide blocks
        assert_eq!(stats.ranges, 9);
        shutdown.store(true, Ordering::SeqCst);
        server_thread.join().unwrap().unwrap();

        let local = crate::core::ScampEngine::new(EngineConfig {
            threads: 1,
            ..Default::default()
        })
        .compute(&spec)
        .unwrap();
        match (result.profile_rows.unwrap().data(), local.profile_rows.unwrap().data()) {
            (ProfileData::NearestNeighbor(a), ProfileData::NearestNeighbor(b)) => {
                assert_eq!(a.len(), 171);
                for (p, q) in a.iter().zip(b) {
                    assert!((p.corr - q.corr).abs() < 1e-9);
                    assert_eq!(p.index, q.index);
                }
            }
            _ => panic!("unexpected profile data"),
        }
    }
}
