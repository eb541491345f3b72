//! Local computation engine
//!
//! Orchestrates the complete flow of one job unit:
//! 1. Validate the job spec and precompute window statistics
//! 2. Plan tiles
//! 3. Dispatch tiles across the resource pool
//! 4. Combine tile partials into unit-level accumulators
//! 5. Fold and finalize (local jobs only)

use super::dispatcher::{DeviceBackend, DeviceRegistry, ResourceDispatcher, ResourcePool};
use super::kernel::{TileOutput, UnitContext};
use super::{JobSpec, TilePlan};
use crate::config::{ComputeOptions, EngineConfig, ProfileType};
use crate::error::{Result, ScampError};
use crate::profile::{fold_symmetric, ProfileAccumulator, ProfileOutput};
use crate::progress::ProgressReporter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Row and column accumulators of one job or job unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    /// Row profile (also holds pooled summaries)
    pub rows: Option<ProfileAccumulator>,
    /// Column profile
    pub cols: Option<ProfileAccumulator>,
}

impl ProfileSet {
    /// Empty accumulators sized for `spec`
    pub fn empty(spec: &JobSpec) -> Result<Self> {
        let extent = spec.extent();
        let rows = if spec.wants_rows() {
            Some(ProfileAccumulator::new(
                spec.profile_kind,
                spec.row_offset(),
                spec.n_rows(),
                extent,
            )?)
        } else {
            None
        };
        let cols = if spec.wants_columns() {
            Some(ProfileAccumulator::new(
                spec.profile_kind,
                spec.col_offset(),
                spec.n_cols(),
                extent,
            )?)
        } else {
            None
        };
        Ok(Self { rows, cols })
    }

    /// Combine a partial set whose windows lie inside this one
    pub fn combine(&mut self, other: &ProfileSet) -> Result<()> {
        combine_side(&mut self.rows, &other.rows)?;
        combine_side(&mut self.cols, &other.cols)
    }

    /// Check that `other` carries the same sides as this set, each with
    /// the same kind and window
    pub fn check_shape(&self, other: &ProfileSet) -> Result<()> {
        check_side("row", &self.rows, &other.rows)?;
        check_side("column", &self.cols, &other.cols)
    }

    fn merge_tile(&mut self, tile: &TileOutput) -> Result<()> {
        combine_side(&mut self.rows, &tile.rows)?;
        combine_side(&mut self.cols, &tile.cols)
    }

    /// Produce the final profiles for `spec`.
    ///
    /// Symmetric self-joins fold the column profile into the row profile
    /// here; this must run exactly once per job. Sides the job did not ask
    /// for are dropped.
    pub fn finish(mut self, spec: &JobSpec) -> Result<ProfileSet> {
        match (&mut self.rows, &mut self.cols) {
            (Some(rows), Some(cols)) if spec.is_symmetric() => fold_symmetric(rows, cols)?,
            _ => {
                if let Some(rows) = &mut self.rows {
                    rows.finalize();
                }
                if let Some(cols) = &mut self.cols {
                    cols.finalize();
                }
            }
        }

        if !spec.compute_rows && !spec.profile_kind.is_pooled() {
            self.rows = None;
        }
        if !spec.compute_columns {
            self.cols = None;
        }
        Ok(self)
    }
}

fn combine_side(dst: &mut Option<ProfileAccumulator>, src: &Option<ProfileAccumulator>) -> Result<()> {
    match (dst, src) {
        (Some(d), Some(s)) => d.combine(s),
        (None, Some(_)) => Err(ScampError::invalid_state(
            "partial carries a profile side the job does not compute",
        )),
        (Some(_), None) => Err(ScampError::invalid_state(
            "partial is missing a profile side the job computes",
        )),
        (None, None) => Ok(()),
    }
}

fn check_side(side: &str, expected: &Option<ProfileAccumulator>, actual: &Option<ProfileAccumulator>) -> Result<()> {
    match (expected, actual) {
        (Some(e), Some(a)) => {
            if e.kind() != a.kind() || e.origin() != a.origin() || e.len() != a.len() {
                return Err(ScampError::validation(format!(
                    "{} profile covers {} [{}..{}), expected {} [{}..{})",
                    side,
                    a.kind(),
                    a.origin(),
                    a.origin() + a.len(),
                    e.kind(),
                    e.origin(),
                    e.origin() + e.len()
                )));
            }
            Ok(())
        }
        (Some(_), None) => Err(ScampError::validation(format!("{} profile is missing", side))),
        (None, Some(_)) => Err(ScampError::validation(format!("unexpected {} profile", side))),
        (None, None) => Ok(()),
    }
}

/// Local matrix profile engine
pub struct ScampEngine {
    /// Configuration
    config: EngineConfig,
    /// Registered accelerator devices
    devices: DeviceRegistry,
    /// Progress reporter
    progress: Option<Arc<ProgressReporter>>,
}

impl ScampEngine {
    /// Create a new engine
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            devices: DeviceRegistry::new(),
            progress: None,
        }
    }

    /// Set progress reporter
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Attached progress reporter, if any
    pub fn progress(&self) -> Option<&ProgressReporter> {
        self.progress.as_deref()
    }

    /// Register an accelerator device
    pub fn with_device(mut self, id: i32, backend: Arc<dyn DeviceBackend>) -> Self {
        self.devices.register(id, backend);
        self
    }

    /// Number of registered accelerator devices
    pub fn num_available_gpus(&self) -> usize {
        self.devices.num_available_gpus()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resource pool selected by the configuration
    pub fn resources(&self) -> Result<ResourcePool> {
        ResourcePool::from_options(&self.devices, &self.config.gpus, self.config.threads)
    }

    /// Compute the raw, unfolded partials of a job unit.
    ///
    /// Accumulators carry absolute origins so the result can be combined
    /// into the enclosing job.
    pub fn execute(&self, spec: &JobSpec) -> Result<ProfileSet> {
        let unit = UnitContext::new(spec)?;
        let plan = TilePlan::for_spec(spec);
        let pool = self.resources()?;

        debug!(
            "Computing {} ({} tiles, edges {:?}) on {:?}",
            spec.describe(),
            plan.len(),
            plan.edges(),
            pool.resources()
        );

        let mut profiles = ProfileSet::empty(spec)?;
        let mut dispatcher = ResourceDispatcher::new(&pool, self.config.tile_retry_budget);
        let progress = self.progress.as_deref().filter(|_| !spec.silent);
        if let Some(progress) = progress {
            progress.set_status(&spec.describe());
            dispatcher = dispatcher.with_progress(progress);
        }

        let stats = dispatcher.run(&unit, plan, |tile| profiles.merge_tile(&tile))?;

        debug!(
            "Merged {} tiles ({} retries) in {:?}",
            stats.tiles, stats.retries, stats.duration
        );
        Ok(profiles)
    }

    /// Validate, compute, fold and finalize a job; returns a copy of the
    /// spec with its profiles populated
    pub fn compute(&self, spec: &JobSpec) -> Result<JobSpec> {
        let profiles = match self.execute(spec) {
            Ok(profiles) => profiles,
            Err(e) => {
                if let Some(progress) = self.progress.as_deref().filter(|_| !spec.silent) {
                    progress.finish_error(&e.to_string());
                }
                return Err(e);
            }
        };
        let profiles = profiles.finish(spec)?;

        if let Some(progress) = self.progress.as_deref().filter(|_| !spec.silent) {
            progress.finish_success("profile complete");
        }
        info!("Computed {}", spec.describe());

        let mut result = spec.clone();
        result.profile_rows = profiles.rows;
        result.profile_columns = profiles.cols;
        Ok(result)
    }
}

impl Default for ScampEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Output side read for a finished job: rows, or columns for a
/// columns-only job
pub fn primary_output(result: &JobSpec, pearson: bool) -> Result<ProfileOutput> {
    let acc = result
        .profile_rows
        .as_ref()
        .or(result.profile_columns.as_ref())
        .ok_or_else(|| ScampError::invalid_state("job result carries no profile"))?;
    Ok(ProfileOutput::from_accumulator(acc, result.window, pearson))
}

fn run_local(spec: JobSpec, profile: ProfileType, options: &ComputeOptions) -> Result<ProfileOutput> {
    let spec = options.apply_to(spec, profile);
    let mut engine = ScampEngine::new(EngineConfig::from_options(options));
    if !options.silent {
        engine = engine.with_progress(ProgressReporter::new());
    }
    let result = engine.compute(&spec)?;
    primary_output(&result, options.pearson)
}

/// Self-join matrix profile of `series`
pub fn self_join(series: &[f64], window: usize, profile: ProfileType, options: &ComputeOptions) -> Result<ProfileOutput> {
    run_local(JobSpec::self_join(series.to_vec(), window), profile, options)
}

/// AB-join: every subsequence of `a` searched in `b`
pub fn ab_join(
    a: &[f64],
    b: &[f64],
    window: usize,
    profile: ProfileType,
    options: &ComputeOptions,
) -> Result<ProfileOutput> {
    run_local(JobSpec::ab_join(a.to_vec(), b.to_vec(), window), profile, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileData, ProfileKind};

    fn series(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                (t * 0.13).sin() * 2.0 + (t * 0.041).cos() + ((i * 17) % 11) as f64 * 0.07
            })
            .collect()
    }

    fn engine() -> ScampEngine {
        ScampEngine::new(EngineConfig {
            threads: 2,
            ..Default::default()
        })
    }

    fn nn_values(acc: &ProfileAccumulator) -> Vec<(f64, u64)> {
        match acc.data() {
            ProfileData::NearestNeighbor(v) => v.iter().map(|n| (n.corr, n.index)).collect(),
            _ => panic!("unexpected data"),
        }
    }

    #[test]
    fn test_tiling_invariance() {
        let base = JobSpec::self_join(series(500), 16);
        let whole = engine().compute(&base).unwrap();
        for tile_size in [37, 100, 499] {
            let tiled = engine()
                .compute(&base.clone().with_max_tile_size(tile_size))
                .unwrap();
            let a = nn_values(whole.profile_rows.as_ref().unwrap());
            let b = nn_values(tiled.profile_rows.as_ref().unwrap());
            for ((ca, ia), (cb, ib)) in a.iter().zip(&b) {
                assert!((ca - cb).abs() < 1e-9);
                assert_eq!(ia, ib);
            }
        }
    }

    #[test]
    fn test_self_join_symmetry() {
        for kind in [
            ProfileKind::NearestNeighbor,
            ProfileKind::KNearest { k: 4 },
            ProfileKind::ThresholdedSum,
        ] {
            let spec = JobSpec::self_join(series(300), 12)
                .with_kind(kind)
                .with_max_tile_size(70);
            let result = engine().compute(&spec).unwrap();
            assert_eq!(result.profile_rows, result.profile_columns, "{}", kind);
            assert!(result.profile_rows.as_ref().unwrap().is_finalized());
        }
    }

    #[test]
    fn test_symmetric_matches_full_matrix() {
        let symmetric = JobSpec::self_join(series(260), 10)
            .with_kind(ProfileKind::ThresholdedSum)
            .with_threshold(0.3)
            .with_max_tile_size(50);
        let mut separate = symmetric.clone();
        separate.keep_rows_separate = true;

        let a = engine().compute(&symmetric).unwrap();
        let b = engine().compute(&separate).unwrap();
        match (a.profile_rows.unwrap().data(), b.profile_rows.unwrap().data()) {
            (ProfileData::ThresholdedSum(x), ProfileData::ThresholdedSum(y)) => {
                for (p, q) in x.iter().zip(y) {
                    assert!((p - q).abs() < 1e-9);
                }
            }
            _ => panic!("unexpected data"),
        }
    }

    #[test]
    fn test_tie_break_prefers_smaller_index() {
        // Windows at 0, 10 and 20 are identical, so row 0 ties at 10 and 20.
        // Integer values with m = 4 keep every window statistic exact.
        let pattern = [0.0, 3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0, 5.0];
        let mut values = Vec::new();
        for _ in 0..3 {
            values.extend_from_slice(&pattern);
        }
        values.extend_from_slice(&[7.0, 1.0, 8.0]);

        for tile_size in [4, 8, 30] {
            let spec = JobSpec::self_join(values.clone(), 4).with_max_tile_size(tile_size);
            let result = engine().compute(&spec).unwrap();
            let rows = nn_values(result.profile_rows.as_ref().unwrap());
            assert_eq!(rows[0].1, 10, "tile size {}", tile_size);
            assert!((rows[0].0 - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_small_series_end_to_end() {
        let series: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let spec = JobSpec::self_join(series, 4);
        let result = engine().compute(&spec).unwrap();

        let rows = nn_values(result.profile_rows.as_ref().unwrap());
        assert_eq!(rows.len(), 7);
        for (r, (corr, index)) in rows.iter().enumerate() {
            assert!(*corr <= 1.0 + 1e-9);
            assert!(index.abs_diff(r as u64) > 1);
        }
    }

    #[test]
    fn test_knn_facade() {
        let options = ComputeOptions {
            k: 3,
            pearson: true,
            ..Default::default()
        };
        let output = self_join(&series(200), 10, ProfileType::KNearest, &options).unwrap();
        match output {
            ProfileOutput::KNearest { matches } => {
                for source in 0..191u64 {
                    let entries: Vec<_> = matches.iter().filter(|m| m.source_index == source).collect();
                    assert!(entries.len() <= 3);
                    for pair in entries.windows(2) {
                        assert!(pair[0].value >= pair[1].value);
                    }
                }
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_ab_join_facade_distances() {
        let a = series(150);
        let b: Vec<f64> = a.iter().map(|v| v * 4.0 + 1.0).collect();
        let output = ab_join(&a, &b, 8, ProfileType::NearestNeighbor, &ComputeOptions::default()).unwrap();
        match output {
            ProfileOutput::NearestNeighbor { values, indices } => {
                assert_eq!(values.len(), 143);
                // Every window of A reappears scaled in B at the same offset
                for (i, (d, idx)) in values.iter().zip(&indices).enumerate() {
                    assert!(d.abs() < 1e-3, "row {} distance {}", i, d);
                    assert_eq!(*idx, i as i64);
                }
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_pooled_summary() {
        let spec = JobSpec::self_join(series(200), 8)
            .with_kind(ProfileKind::PooledSummary { height: 4, width: 4 })
            .with_max_tile_size(60);
        let result = engine().compute(&spec).unwrap();
        assert!(result.profile_columns.is_none());

        match ProfileOutput::from_accumulator(result.profile_rows.as_ref().unwrap(), 8, true) {
            ProfileOutput::PooledSummary(matrix) => {
                for r in 0..4 {
                    for c in 0..4 {
                        let v = matrix.get(r, c).unwrap();
                        assert!((v - matrix.get(c, r).unwrap()).abs() < 1e-12);
                        assert!(v <= 1.0);
                    }
                }
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_combine_requires_matching_sides() {
        let spec = JobSpec::self_join(series(120), 8);
        let mut full = ProfileSet::empty(&spec).unwrap();
        let partial = engine().execute(&spec).unwrap();
        assert!(full.check_shape(&partial).is_ok());

        let missing = ProfileSet {
            rows: partial.rows.clone(),
            cols: None,
        };
        assert!(full.check_shape(&missing).unwrap_err().is_validation());
        assert!(full.combine(&missing).is_err());

        let shifted = ProfileSet {
            rows: Some(ProfileAccumulator::new(spec.profile_kind, 1, spec.n_rows() - 1, spec.extent()).unwrap()),
            cols: partial.cols.clone(),
        };
        assert!(full.check_shape(&shifted).is_err());
        full.combine(&partial).unwrap();
    }

    #[test]
    fn test_validation_rejected_before_compute() {
        let err = engine().compute(&JobSpec::self_join(vec![1.0, 2.0], 4)).unwrap_err();
        assert!(err.is_validation());

        let err = ScampEngine::new(EngineConfig {
            gpus: vec![3],
            ..Default::default()
        })
        .compute(&JobSpec::self_join(series(50), 4))
        .unwrap_err();
        assert!(err.is_validation());
    }
}
