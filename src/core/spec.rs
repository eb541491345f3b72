//! Job specification
//!
//! A [`JobSpec`] is the immutable description of one matrix profile job:
//! the input series, window length, profile kind, precision policy and the
//! optional absolute offsets used when the job is a distributed work range.

use crate::error::{Result, ScampError};
use crate::profile::{MatrixExtent, ProfileAccumulator, ProfileKind};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default maximum tile edge, in subsequences
pub const DEFAULT_MAX_TILE_SIZE: usize = 128_000;

/// Default number of neighbors for [`ProfileKind::KNearest`]
pub const DEFAULT_K: usize = 5;

/// Default pooled summary grid edge
pub const DEFAULT_MATRIX_DIM: usize = 50;

/// Numeric precision policy for the tile kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum Precision {
    /// Double precision throughout (reference)
    #[default]
    Double,
    /// Single precision candidate pass with double precision confirmation
    Mixed,
    /// Single precision throughout
    Single,
}

impl Precision {
    /// Maximum absolute correlation error relative to the double reference
    pub fn tolerance(&self) -> f64 {
        match self {
            Precision::Double => 1e-9,
            Precision::Mixed => 1e-4,
            Precision::Single => 1e-2,
        }
    }

    /// Policy name
    pub fn name(&self) -> &'static str {
        match self {
            Precision::Double => "double",
            Precision::Mixed => "mixed",
            Precision::Single => "single",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Precision {
    type Err = ScampError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "double" => Ok(Precision::Double),
            "mixed" => Ok(Precision::Mixed),
            "single" => Ok(Precision::Single),
            other => Err(ScampError::validation(format!(
                "precision must be one of single, mixed or double (got '{}')",
                other
            ))),
        }
    }
}

/// Description of a matrix profile job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Row series (A)
    pub series_a: Vec<f64>,
    /// Column series (B); `None` for a self-join
    pub series_b: Option<Vec<f64>>,
    /// Whether A is joined with itself
    pub self_join: bool,
    /// Subsequence length
    pub window: usize,
    /// Produce the row profile
    pub compute_rows: bool,
    /// Produce the column profile
    pub compute_columns: bool,
    /// Keep row and column profiles separate instead of exploiting symmetry
    pub keep_rows_separate: bool,
    /// A and B share a time axis; applies the exclusion zone to AB-joins
    pub is_aligned: bool,
    /// Correlation threshold for sums and k-nearest lists
    pub distance_threshold: f64,
    /// Kernel precision policy
    pub precision: Precision,
    /// Statistic to compute
    pub profile_kind: ProfileKind,
    /// Maximum tile edge, in subsequences
    pub max_tile_size: usize,
    /// Absolute row offset of this unit within a larger job
    pub distributed_start_row: Option<usize>,
    /// Absolute column offset of this unit within a larger job
    pub distributed_start_col: Option<usize>,
    /// Logical matrix size of the enclosing job
    pub distributed_extent: Option<MatrixExtent>,
    /// Suppress progress output
    pub silent: bool,
    /// Row profile, populated on results only
    pub profile_rows: Option<ProfileAccumulator>,
    /// Column profile, populated on results only
    pub profile_columns: Option<ProfileAccumulator>,
}

impl JobSpec {
    fn base(series_a: Vec<f64>, series_b: Option<Vec<f64>>, window: usize) -> Self {
        Self {
            self_join: series_b.is_none(),
            series_a,
            series_b,
            window,
            compute_rows: true,
            compute_columns: false,
            keep_rows_separate: false,
            is_aligned: false,
            distance_threshold: 0.0,
            precision: Precision::Double,
            profile_kind: ProfileKind::NearestNeighbor,
            max_tile_size: DEFAULT_MAX_TILE_SIZE,
            distributed_start_row: None,
            distributed_start_col: None,
            distributed_extent: None,
            silent: true,
            profile_rows: None,
            profile_columns: None,
        }
    }

    /// Self-join of `series` with window `window`
    pub fn self_join(series: Vec<f64>, window: usize) -> Self {
        let mut spec = Self::base(series, None, window);
        spec.compute_columns = true;
        spec
    }

    /// AB-join: every subsequence of `a` searched in `b`
    pub fn ab_join(a: Vec<f64>, b: Vec<f64>, window: usize) -> Self {
        Self::base(a, Some(b), window)
    }

    /// Set the profile kind
    pub fn with_kind(mut self, kind: ProfileKind) -> Self {
        self.profile_kind = kind;
        self
    }

    /// Set the precision policy
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Set the correlation threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.distance_threshold = threshold;
        self
    }

    /// Set the maximum tile edge
    pub fn with_max_tile_size(mut self, size: usize) -> Self {
        self.max_tile_size = size;
        self
    }

    /// Column series
    pub fn series_b(&self) -> &[f64] {
        self.series_b.as_deref().unwrap_or(&self.series_a)
    }

    /// Number of row subsequences in this unit
    pub fn n_rows(&self) -> usize {
        (self.series_a.len() + 1).saturating_sub(self.window)
    }

    /// Number of column subsequences in this unit
    pub fn n_cols(&self) -> usize {
        (self.series_b().len() + 1).saturating_sub(self.window)
    }

    /// Absolute index of the first row
    pub fn row_offset(&self) -> usize {
        self.distributed_start_row.unwrap_or(0)
    }

    /// Absolute index of the first column
    pub fn col_offset(&self) -> usize {
        self.distributed_start_col.unwrap_or(0)
    }

    /// Logical matrix size of the job this unit belongs to
    pub fn extent(&self) -> MatrixExtent {
        self.distributed_extent
            .unwrap_or_else(|| MatrixExtent::new(self.n_rows(), self.n_cols()))
    }

    /// Half-width of the trivial-match exclusion zone, if one applies
    pub fn exclusion_zone(&self) -> Option<usize> {
        if self.self_join || self.is_aligned {
            Some(self.window.div_ceil(4))
        } else {
            None
        }
    }

    /// Whether only the upper triangle of this unit is evaluated
    pub fn is_symmetric(&self) -> bool {
        self.self_join
            && !self.keep_rows_separate
            && self.row_offset() == self.col_offset()
            && self.n_rows() == self.n_cols()
    }

    /// Whether the unit produces a row accumulator
    pub fn wants_rows(&self) -> bool {
        self.compute_rows || self.profile_kind.is_pooled() || self.is_symmetric()
    }

    /// Whether the unit produces a column accumulator
    pub fn wants_columns(&self) -> bool {
        !self.profile_kind.is_pooled() && (self.compute_columns || self.is_symmetric())
    }

    /// Copy of the spec without inputs or results, for logging and status
    pub fn describe(&self) -> String {
        format!(
            "{} {}x{} m={} kind={} precision={}",
            if self.self_join { "self-join" } else { "ab-join" },
            self.n_rows(),
            self.n_cols(),
            self.window,
            self.profile_kind,
            self.precision
        )
    }

    /// Check the spec before any computation starts
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(ScampError::validation(format!(
                "window must be at least 2 (got {})",
                self.window
            )));
        }
        if self.series_a.len() < self.window {
            return Err(ScampError::validation(format!(
                "series A has {} points, fewer than the window length {}",
                self.series_a.len(),
                self.window
            )));
        }
        match (&self.series_b, self.self_join) {
            (None, false) => {
                return Err(ScampError::validation("AB-join requires a second series"));
            }
            (Some(_), true) if self.distributed_start_col.is_none() => {
                return Err(ScampError::validation(
                    "self-join must not carry a second series",
                ));
            }
            (Some(b), _) if b.len() < self.window => {
                return Err(ScampError::validation(format!(
                    "series B has {} points, fewer than the window length {}",
                    b.len(),
                    self.window
                )));
            }
            _ => {}
        }
        if self.series_a.iter().chain(self.series_b.iter().flatten()).any(|v| !v.is_finite()) {
            return Err(ScampError::validation("input series contain non-finite values"));
        }
        if !self.distance_threshold.is_finite() || !(-1.0..=1.0).contains(&self.distance_threshold) {
            return Err(ScampError::validation(format!(
                "threshold must be within [-1, 1] (got {})",
                self.distance_threshold
            )));
        }
        if self.max_tile_size == 0 {
            return Err(ScampError::validation("max_tile_size must be greater than 0"));
        }
        match self.profile_kind {
            ProfileKind::KNearest { k } if k == 0 => {
                return Err(ScampError::validation("k must be at least 1"));
            }
            ProfileKind::PooledSummary { height, width } if height == 0 || width == 0 => {
                return Err(ScampError::validation(
                    "mheight and mwidth must be greater than 0",
                ));
            }
            _ => {}
        }
        if !self.compute_rows && !self.compute_columns {
            return Err(ScampError::validation(
                "at least one of rows or columns must be computed",
            ));
        }
        if let Some(extent) = self.distributed_extent {
            if self.row_offset() + self.n_rows() > extent.rows
                || self.col_offset() + self.n_cols() > extent.cols
            {
                return Err(ScampError::validation(format!(
                    "unit [{}+{}, {}+{}] exceeds matrix extent {}x{}",
                    self.row_offset(),
                    self.n_rows(),
                    self.col_offset(),
                    self.n_cols(),
                    extent.rows,
                    extent.cols
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| (i as f64 * 0.3).sin()).collect()
    }

    #[test]
    fn test_defaults() {
        let spec = JobSpec::self_join(ramp(100), 10);
        assert!(spec.self_join);
        assert!(spec.compute_rows && spec.compute_columns);
        assert_eq!(spec.max_tile_size, DEFAULT_MAX_TILE_SIZE);
        assert_eq!(spec.precision, Precision::Double);
        assert!(spec.silent);
        assert_eq!(spec.n_rows(), 91);
        assert_eq!(spec.n_cols(), 91);
        assert!(spec.is_symmetric());
        assert_eq!(spec.exclusion_zone(), Some(3));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_ab_join_shape() {
        let spec = JobSpec::ab_join(ramp(50), ramp(30), 5);
        assert!(!spec.self_join);
        assert_eq!(spec.n_rows(), 46);
        assert_eq!(spec.n_cols(), 26);
        assert_eq!(spec.exclusion_zone(), None);
        assert!(!spec.is_symmetric());
        assert!(spec.wants_rows() && !spec.wants_columns());
    }

    #[test]
    fn test_validation_failures() {
        assert!(JobSpec::self_join(ramp(10), 1).validate().unwrap_err().is_validation());
        assert!(JobSpec::self_join(ramp(3), 4).validate().is_err());
        assert!(JobSpec::self_join(ramp(20), 4).with_threshold(1.5).validate().is_err());
        assert!(JobSpec::self_join(ramp(20), 4).with_max_tile_size(0).validate().is_err());
        assert!(JobSpec::self_join(ramp(20), 4)
            .with_kind(ProfileKind::KNearest { k: 0 })
            .validate()
            .is_err());
        assert!(JobSpec::self_join(ramp(20), 4)
            .with_kind(ProfileKind::PooledSummary { height: 0, width: 3 })
            .validate()
            .is_err());

        let mut nan = ramp(20);
        nan[7] = f64::NAN;
        assert!(JobSpec::self_join(nan, 4).validate().is_err());
    }

    #[test]
    fn test_extent_bounds() {
        let mut spec = JobSpec::ab_join(ramp(20), ramp(20), 4);
        spec.distributed_start_row = Some(10);
        spec.distributed_extent = Some(MatrixExtent::new(20, 17));
        assert!(spec.validate().is_err());

        spec.distributed_extent = Some(MatrixExtent::new(27, 17));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("mixed".parse::<Precision>().unwrap(), Precision::Mixed);
        assert!("half".parse::<Precision>().is_err());
        assert!(Precision::Single.tolerance() > Precision::Mixed.tolerance());
    }
}
