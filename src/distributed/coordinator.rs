//! Job coordinator
//!
//! Owns every distributed job and drives it through
//! `Queued -> Running -> {Finished, Failed}`:
//! - Jobs are split into square work ranges handed out to workers
//! - Ranges not reported before their liveness deadline are reclaimed
//! - Worker partials are combined under the coordinator lock
//! - The symmetric fold and finalization run once, when the last range lands

use crate::config::CoordinatorConfig;
use crate::core::{JobSpec, ProfileSet, REFRESH_INTERVAL};
use crate::error::{Result, ScampError};
use crate::profile::ProfileAccumulator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible job status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted, not yet partitioned
    Queued,
    /// Work ranges in progress
    Running {
        /// Ranges combined so far
        ranges_done: usize,
        /// Ranges in the job
        ranges_total: usize,
    },
    /// Result available
    Finished,
    /// A work range exhausted its attempts
    Failed {
        /// Failure reason
        reason: String,
    },
}

impl JobStatus {
    /// Short status name
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running { .. } => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed { .. } => "failed",
        }
    }

    /// Whether the job will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed { .. })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running {
                ranges_done,
                ranges_total,
            } => write!(f, "running ({}/{} ranges)", ranges_done, ranges_total),
            JobStatus::Failed { reason } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// One line of the job listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id
    pub id: u64,
    /// Current status
    pub status: JobStatus,
    /// Job description (kind, shape, window)
    pub description: String,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Time the job reached Finished or Failed
    pub finished_at: Option<DateTime<Utc>>,
    /// First result fetch
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A square block of the job's distance matrix, in subsequence indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRange {
    /// Position in the job's range list
    pub id: usize,
    /// First row
    pub row_start: usize,
    /// One past the last row
    pub row_end: usize,
    /// First column
    pub col_start: usize,
    /// One past the last column
    pub col_end: usize,
}

/// Work handed to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Job id
    pub job_id: u64,
    /// Range id within the job
    pub range: usize,
    /// Self-contained unit spec for the range
    pub spec: JobSpec,
}

/// Split an `n_rows` x `n_cols` matrix into blocks of edge `range_size`,
/// rounded up to a multiple of [`REFRESH_INTERVAL`]. Symmetric jobs keep
/// only blocks on or above the block diagonal. Edges larger than the
/// matrix yield a single block.
pub fn partition_ranges(n_rows: usize, n_cols: usize, range_size: usize, symmetric: bool) -> Vec<WorkRange> {
    let span = n_rows.max(n_cols).max(1);
    let edge = range_size.clamp(1, span).div_ceil(REFRESH_INTERVAL) * REFRESH_INTERVAL;
    let row_blocks = n_rows.div_ceil(edge);
    let col_blocks = n_cols.div_ceil(edge);

    let mut ranges = Vec::new();
    for rb in 0..row_blocks {
        let first_col = if symmetric { rb } else { 0 };
        for cb in first_col..col_blocks {
            ranges.push(WorkRange {
                id: ranges.len(),
                row_start: rb * edge,
                row_end: ((rb + 1) * edge).min(n_rows),
                col_start: cb * edge,
                col_end: ((cb + 1) * edge).min(n_cols),
            });
        }
    }
    ranges
}

/// Unit spec computing `range` of `parent`
fn unit_spec(parent: &JobSpec, range: &WorkRange) -> JobSpec {
    let m = parent.window;
    let cols_src = parent.series_b.as_deref().unwrap_or(&parent.series_a);

    let mut unit = parent.clone();
    unit.series_a = parent.series_a[range.row_start..range.row_end + m - 1].to_vec();
    unit.series_b = Some(cols_src[range.col_start..range.col_end + m - 1].to_vec());
    unit.compute_rows = parent.wants_rows();
    unit.compute_columns = parent.wants_columns();
    unit.distributed_start_row = Some(range.row_start);
    unit.distributed_start_col = Some(range.col_start);
    unit.distributed_extent = Some(parent.extent());
    unit.silent = true;
    unit.profile_rows = None;
    unit.profile_columns = None;
    unit
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Assigned { worker: String, deadline: Instant },
    Done,
}

#[derive(Debug)]
struct RangeState {
    range: WorkRange,
    slot: Slot,
    failures: usize,
    /// Every worker the range was handed to
    holders: Vec<String>,
}

#[derive(Debug, Clone)]
enum JobState {
    Queued,
    Running,
    Finished,
    Failed { reason: String },
}

#[derive(Debug)]
struct Job {
    id: u64,
    spec: Arc<JobSpec>,
    state: JobState,
    ranges: Vec<RangeState>,
    ranges_done: usize,
    profiles: Option<ProfileSet>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    fetched_at: Option<DateTime<Utc>>,
}

impl Job {
    fn status(&self) -> JobStatus {
        match &self.state {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running {
                ranges_done: self.ranges_done,
                ranges_total: self.ranges.len(),
            },
            JobState::Finished => JobStatus::Finished,
            JobState::Failed { reason } => JobStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status(),
            description: self.spec.describe(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            fetched_at: self.fetched_at,
        }
    }

    fn fail(&mut self, reason: String) {
        warn!("Job {} failed: {}", self.id, reason);
        self.state = JobState::Failed { reason };
        self.profiles = None;
        self.finished_at = Some(Utc::now());
    }

    /// Count a failed attempt on `range`; fails the job once the budget is spent
    fn record_failure(&mut self, range: usize, reason: &str, max_attempts: usize) {
        let state = &mut self.ranges[range];
        state.failures += 1;
        if state.failures >= max_attempts {
            let failures = state.failures;
            self.fail(format!(
                "work range {} failed {} times, last: {}",
                range, failures, reason
            ));
        } else {
            state.slot = Slot::Pending;
        }
    }

    fn ensure_result(&self) -> Result<&ProfileSet> {
        match (&self.state, &self.profiles) {
            (JobState::Finished, Some(profiles)) => Ok(profiles),
            (JobState::Failed { reason }, _) => Err(ScampError::JobFailed {
                job: self.id,
                reason: reason.clone(),
            }),
            _ => Err(ScampError::JobNotFinished {
                job: self.id,
                status: self.status().to_string(),
            }),
        }
    }
}

/// Coordinator owning all distributed job state
#[derive(Debug)]
pub struct JobCoordinator {
    config: CoordinatorConfig,
    jobs: Mutex<BTreeMap<u64, Job>>,
    next_id: AtomicU64,
}

impl JobCoordinator {
    /// Create a coordinator
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<u64, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| ScampError::invalid_state("coordinator state lock poisoned"))
    }

    /// Validate and register a job; returns its id
    pub fn submit(&self, spec: JobSpec) -> Result<u64> {
        spec.validate()?;
        if spec.distributed_start_row.is_some()
            || spec.distributed_start_col.is_some()
            || spec.distributed_extent.is_some()
        {
            return Err(ScampError::validation(
                "submitted jobs must not carry work range offsets",
            ));
        }
        if spec.series_b.is_some() && spec.self_join {
            return Err(ScampError::validation("self-join must not carry a second series"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut job = Job {
            id,
            spec: Arc::new(spec),
            state: JobState::Queued,
            ranges: Vec::new(),
            ranges_done: 0,
            profiles: None,
            created_at: Utc::now(),
            finished_at: None,
            fetched_at: None,
        };

        let ranges = partition_ranges(
            job.spec.n_rows(),
            job.spec.n_cols(),
            self.config.range_size,
            job.spec.is_symmetric(),
        );
        job.profiles = Some(ProfileSet::empty(&job.spec)?);
        job.ranges = ranges
            .into_iter()
            .map(|range| RangeState {
                range,
                slot: Slot::Pending,
                failures: 0,
                holders: Vec::new(),
            })
            .collect();
        job.state = JobState::Running;

        info!(
            "Job {} submitted: {} in {} work ranges",
            id,
            job.spec.describe(),
            job.ranges.len()
        );
        self.lock()?.insert(id, job);
        Ok(id)
    }

    /// Reclaim expired assignments, then hand out the first pending range
    /// of the oldest running job
    pub fn assign_next_work_range(&self, worker: &str) -> Result<Option<WorkAssignment>> {
        let now = Instant::now();
        let mut jobs = self.lock()?;

        for job in jobs.values_mut() {
            if !matches!(job.state, JobState::Running) {
                continue;
            }
            let expired: Vec<usize> = job
                .ranges
                .iter()
                .filter(|r| matches!(&r.slot, Slot::Assigned { deadline, .. } if *deadline <= now))
                .map(|r| r.range.id)
                .collect();
            for range in expired {
                let timeout = ScampError::LivenessTimeout { job: job.id, range };
                warn!("{}; reclaiming", timeout);
                job.record_failure(range, &timeout.to_string(), self.config.max_range_attempts);
                if !matches!(job.state, JobState::Running) {
                    break;
                }
            }
        }

        for job in jobs.values_mut() {
            if !matches!(job.state, JobState::Running) {
                continue;
            }
            if let Some(state) = job.ranges.iter_mut().find(|r| matches!(r.slot, Slot::Pending)) {
                state.slot = Slot::Assigned {
                    worker: worker.to_string(),
                    deadline: now + self.config.liveness_timeout,
                };
                if !state.holders.iter().any(|h| h == worker) {
                    state.holders.push(worker.to_string());
                }
                debug!(
                    "Assigned job {} range {} [{}..{}) x [{}..{}) to {}",
                    job.id,
                    state.range.id,
                    state.range.row_start,
                    state.range.row_end,
                    state.range.col_start,
                    state.range.col_end,
                    worker
                );
                return Ok(Some(WorkAssignment {
                    job_id: job.id,
                    range: state.range.id,
                    spec: unit_spec(&job.spec, &state.range),
                }));
            }
        }

        Ok(None)
    }

    /// Combine the partials of a work range. Returns `false` when the
    /// report is a duplicate or comes from a worker the range was never
    /// assigned to. Results from a worker whose assignment was reclaimed
    /// are still accepted if the range is not done.
    ///
    /// A partial whose sides or windows do not match the range is rejected
    /// with a validation error and counts as a failed attempt for the
    /// current holder.
    pub fn report_work_range_result(
        &self,
        job_id: u64,
        range: usize,
        worker: &str,
        rows: Option<ProfileAccumulator>,
        cols: Option<ProfileAccumulator>,
    ) -> Result<bool> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(ScampError::JobNotFound(job_id))?;

        if !matches!(job.state, JobState::Running) {
            debug!("Ignoring result for job {} range {} from {}: job is {}", job_id, range, worker, job.status());
            return Ok(false);
        }
        let state = job.ranges.get_mut(range).ok_or_else(|| {
            ScampError::validation(format!("job {} has no work range {}", job_id, range))
        })?;
        if matches!(state.slot, Slot::Done) {
            debug!("Ignoring duplicate result for job {} range {} from {}", job_id, range, worker);
            return Ok(false);
        }
        if !state.holders.iter().any(|h| h == worker) {
            warn!("Ignoring result for job {} range {} from unassigned worker {}", job_id, range, worker);
            return Ok(false);
        }

        let partial = ProfileSet { rows, cols };
        let shape = ProfileSet::empty(&unit_spec(&job.spec, &state.range)).and_then(|e| e.check_shape(&partial));
        if let Err(e) = shape {
            let holds = matches!(&state.slot, Slot::Assigned { worker: holder, .. } if holder == worker);
            warn!("Rejected result for job {} range {} from {}: {}", job_id, range, worker, e);
            if holds {
                job.record_failure(range, &e.to_string(), self.config.max_range_attempts);
            }
            return Err(e);
        }
        state.slot = Slot::Done;
        let merged = match job.profiles.as_mut() {
            Some(profiles) => profiles.combine(&partial),
            None => Err(ScampError::invalid_state("running job has no accumulators")),
        };
        if let Err(e) = merged {
            job.fail(format!("partial for range {} from {} rejected: {}", range, worker, e));
            return Err(e);
        }
        job.ranges_done += 1;

        if job.ranges_done == job.ranges.len() {
            let finished = match job.profiles.take() {
                Some(profiles) => profiles.finish(&job.spec),
                None => Err(ScampError::invalid_state("running job has no accumulators")),
            };
            match finished {
                Ok(profiles) => {
                    job.profiles = Some(profiles);
                    job.state = JobState::Finished;
                    job.finished_at = Some(Utc::now());
                    info!("Job {} finished ({} ranges)", job_id, job.ranges.len());
                }
                Err(e) => {
                    job.fail(format!("finalization failed: {}", e));
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Record that `worker` could not compute a range. Reports from workers
    /// that no longer hold the assignment are ignored.
    pub fn report_work_range_failure(&self, job_id: u64, range: usize, worker: &str, reason: &str) -> Result<()> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(ScampError::JobNotFound(job_id))?;

        if !matches!(job.state, JobState::Running) {
            return Ok(());
        }
        let state = job.ranges.get(range).ok_or_else(|| {
            ScampError::validation(format!("job {} has no work range {}", job_id, range))
        })?;
        match &state.slot {
            Slot::Assigned { worker: holder, .. } if holder == worker => {
                warn!("Job {} range {} failed on {}: {}", job_id, range, worker, reason);
                job.record_failure(range, reason, self.config.max_range_attempts);
            }
            _ => debug!("Ignoring stale failure for job {} range {} from {}", job_id, range, worker),
        }
        Ok(())
    }

    /// Current status of a job
    pub fn status(&self, job_id: u64) -> Result<JobStatus> {
        let jobs = self.lock()?;
        jobs.get(&job_id)
            .map(Job::status)
            .ok_or(ScampError::JobNotFound(job_id))
    }

    /// Final profiles of a finished job
    pub fn result(&self, job_id: u64) -> Result<ProfileSet> {
        let jobs = self.lock()?;
        let job = jobs.get(&job_id).ok_or(ScampError::JobNotFound(job_id))?;
        job.ensure_result().cloned()
    }

    /// Copy of the submitted spec with its profiles populated; marks the
    /// job as fetched
    pub fn fetch_result(&self, job_id: u64) -> Result<JobSpec> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(ScampError::JobNotFound(job_id))?;
        let profiles = job.ensure_result()?.clone();

        if job.fetched_at.is_none() {
            job.fetched_at = Some(Utc::now());
        }
        let mut result = (*job.spec).clone();
        result.profile_rows = profiles.rows;
        result.profile_columns = profiles.cols;
        Ok(result)
    }

    /// Summaries of all known jobs, oldest first
    pub fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        Ok(self.lock()?.values().map(Job::summary).collect())
    }

    /// Drop fetched jobs, and failed jobs, older than the retention period.
    /// Returns the number of jobs removed.
    pub fn purge_archived(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.config.retention;
        let expired = |since: Option<DateTime<Utc>>| {
            since
                .and_then(|t| now.signed_duration_since(t).to_std().ok())
                .is_some_and(|age| age >= retention)
        };

        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|_, job| {
            let archived = match job.state {
                JobState::Finished => expired(job.fetched_at),
                JobState::Failed { .. } => expired(job.finished_at),
                _ => false,
            };
            !archived
        });
        let purged = before - jobs.len();
        if purged > 0 {
            info!("Purged {} archived jobs", purged);
        }
        Ok(purged)
    }
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
