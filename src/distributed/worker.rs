//! Compute worker
//!
//! Pulls work ranges from a coordinator, computes them on the local engine
//! and reports the raw partials back.

use super::client::{unexpected, RemoteJobService};
use super::protocol::{Request, Response};
use super::{JobCoordinator, WorkAssignment};
use crate::config::WorkerConfig;
use crate::core::ScampEngine;
use crate::error::Result;
use crate::profile::ProfileAccumulator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Worker-side coordinator operations
pub trait WorkSource {
    /// Next work range, if any is pending
    fn request_work(&self, worker: &str) -> Result<Option<WorkAssignment>>;

    /// Report computed partials; `false` when the coordinator ignored them
    fn report_result(
        &self,
        job_id: u64,
        range: usize,
        worker: &str,
        rows: Option<ProfileAccumulator>,
        cols: Option<ProfileAccumulator>,
    ) -> Result<bool>;

    /// Report that a range could not be computed
    fn report_failure(&self, job_id: u64, range: usize, worker: &str, reason: &str) -> Result<()>;
}

impl WorkSource for JobCoordinator {
    fn request_work(&self, worker: &str) -> Result<Option<WorkAssignment>> {
        self.assign_next_work_range(worker)
    }

    fn report_result(
        &self,
        job_id: u64,
        range: usize,
        worker: &str,
        rows: Option<ProfileAccumulator>,
        cols: Option<ProfileAccumulator>,
    ) -> Result<bool> {
        self.report_work_range_result(job_id, range, worker, rows, cols)
    }

    fn report_failure(&self, job_id: u64, range: usize, worker: &str, reason: &str) -> Result<()> {
        self.report_work_range_failure(job_id, range, worker, reason)
    }
}

impl<S: WorkSource + ?Sized> WorkSource for Arc<S> {
    fn request_work(&self, worker: &str) -> Result<Option<WorkAssignment>> {
        (**self).request_work(worker)
    }

    fn report_result(
        &self,
        job_id: u64,
        range: usize,
        worker: &str,
        rows: Option<ProfileAccumulator>,
        cols: Option<ProfileAccumulator>,
    ) -> Result<bool> {
        (**self).report_result(job_id, range, worker, rows, cols)
    }

    fn report_failure(&self, job_id: u64, range: usize, worker: &str, reason: &str) -> Result<()> {
        (**self).report_failure(job_id, range, worker, reason)
    }
}

impl WorkSource for RemoteJobService {
    fn request_work(&self, worker: &str) -> Result<Option<WorkAssignment>> {
        let request = Request::RequestWork {
            worker: worker.to_string(),
        };
        match self.call(&request)? {
            Response::Work { assignment } => Ok(assignment.map(|a| *a)),
            other => Err(unexpected(other)),
        }
    }

    fn report_result(
        &self,
        job_id: u64,
        range: usize,
        worker: &str,
        rows: Option<ProfileAccumulator>,
        cols: Option<ProfileAccumulator>,
    ) -> Result<bool> {
        let request = Request::ReportWorkResult {
            job_id,
            range,
            worker: worker.to_string(),
            rows,
            cols,
        };
        match self.call(&request)? {
            Response::ResultAccepted { merged } => Ok(merged),
            other => Err(unexpected(other)),
        }
    }

    fn report_failure(&self, job_id: u64, range: usize, worker: &str, reason: &str) -> Result<()> {
        let request = Request::ReportWorkFailure {
            job_id,
            range,
            worker: worker.to_string(),
            reason: reason.to_string(),
        };
        match self.call(&request)? {
            Response::FailureRecorded => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Counters of a worker run
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Ranges computed and reported
    pub ranges: usize,
    /// Ranges reported as failed
    pub failures: usize,
    /// Reports the coordinator ignored as late or duplicate, or rejected
    pub ignored: usize,
}

/// Worker loop over a [`WorkSource`]
pub struct Worker<S> {
    source: S,
    engine: ScampEngine,
    config: WorkerConfig,
}

impl<S: WorkSource> Worker<S> {
    /// Create a worker with an engine built from `config`
    pub fn new(source: S, config: WorkerConfig) -> Self {
        Self {
            source,
            engine: ScampEngine::new(config.engine.clone()),
            config,
        }
    }

    /// Use a preconfigured engine (registered devices, progress)
    pub fn with_engine(mut self, engine: ScampEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Worker id reported to the coordinator
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    fn process(&self, work: WorkAssignment, stats: &mut WorkerStats) -> Result<()> {
        let id = self.id();
        let start = Instant::now();
        debug!("Computing job {} range {}: {}", work.job_id, work.range, work.spec.describe());

        let report = match self.engine.execute(&work.spec) {
            Ok(partial) => {
                let report = self
                    .source
                    .report_result(work.job_id, work.range, id, partial.rows, partial.cols);
                if let Ok(merged) = report {
                    stats.ranges += 1;
                    if !merged {
                        stats.ignored += 1;
                        debug!("Result for job {} range {} was ignored", work.job_id, work.range);
                    }
                    info!(
                        "Job {} range {} done in {}",
                        work.job_id,
                        work.range,
                        humantime::format_duration(Duration::from_millis(start.elapsed().as_millis() as u64))
                    );
                }
                report.map(|_| ())
            }
            Err(e) => {
                warn!("Job {} range {} failed: {}", work.job_id, work.range, e);
                stats.failures += 1;
                self.source
                    .report_failure(work.job_id, work.range, id, &e.to_string())
            }
        };

        match report {
            // The job was purged, failed or rejected the report; the range is lost
            Err(e) if e.is_job_scoped() => {
                warn!("Report for job {} range {} rejected: {}", work.job_id, work.range, e);
                stats.ignored += 1;
                Ok(())
            }
            other => other,
        }
    }

    /// Process at most one range; returns whether one was available
    pub fn run_once(&self) -> Result<bool> {
        let mut stats = WorkerStats::default();
        match self.source.request_work(self.id())? {
            Some(work) => {
                self.process(work, &mut stats)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Keep processing ranges until `shutdown` is set. Transport errors are
    /// logged and retried after the idle backoff.
    pub fn run_until(&self, shutdown: &AtomicBool) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        info!("Worker {} started", self.id());

        while !shutdown.load(Ordering::SeqCst) {
            let outcome = self
                .source
                .request_work(self.id())
                .and_then(|work| match work {
                    Some(work) => self.process(work, &mut stats).map(|_| true),
                    None => Ok(false),
                });

            match outcome {
                Ok(true) => {}
                Ok(false) => self.backoff(shutdown),
                Err(e) if e.is_transient() => {
                    warn!("Coordinator unreachable: {}; retrying", e);
                    self.backoff(shutdown);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Worker {} stopped: {} ranges, {} failures",
            self.id(),
            stats.ranges,
            stats.failures
        );
        Ok(stats)
    }

    /// Sleep for the idle backoff, waking early on shutdown
    fn backoff(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.config.idle_backoff;
        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}
