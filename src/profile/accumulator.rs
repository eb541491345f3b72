//! Profile accumulators
//!
//! A [`ProfileAccumulator`] is the typed result buffer for one side (rows or
//! columns) of a matrix profile computation. Accumulators are windowed: a
//! partial produced for a tile or a work range covers a sub-window of the
//! full profile and is merged into it with [`ProfileAccumulator::combine`].
//!
//! `combine` is associative and commutative for every profile kind, so the
//! order in which tiles, resources or workers finish never changes the
//! outcome (sums are equal up to floating-point rounding).

use crate::error::{Result, ScampError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Match index used when a subsequence has no valid neighbor
pub const NO_MATCH: u64 = u64::MAX;

/// Statistic maintained per subsequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileKind {
    /// Best correlation and its index
    NearestNeighbor,
    /// The k best correlations and their indices
    KNearest {
        /// Number of neighbors kept per subsequence
        k: usize,
    },
    /// Sum of correlations above the distance threshold
    ThresholdedSum,
    /// Max-pooled summary of the whole correlation matrix
    PooledSummary {
        /// Grid rows
        height: usize,
        /// Grid columns
        width: usize,
    },
}

impl ProfileKind {
    /// Short name used in logs and CLI output
    pub fn name(&self) -> &'static str {
        match self {
            ProfileKind::NearestNeighbor => "nearest-neighbor",
            ProfileKind::KNearest { .. } => "k-nearest",
            ProfileKind::ThresholdedSum => "thresholded-sum",
            ProfileKind::PooledSummary { .. } => "pooled-summary",
        }
    }

    /// Whether the kind keeps a single matrix-oriented grid instead of
    /// one entry per subsequence
    pub fn is_pooled(&self) -> bool {
        matches!(self, ProfileKind::PooledSummary { .. })
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileKind::KNearest { k } => write!(f, "{} (k={})", self.name(), k),
            ProfileKind::PooledSummary { height, width } => {
                write!(f, "{} ({}x{})", self.name(), height, width)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Logical size of a correlation matrix, in subsequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixExtent {
    /// Number of row subsequences
    pub rows: usize,
    /// Number of column subsequences
    pub cols: usize,
}

impl MatrixExtent {
    /// Create a new extent
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Grid cell of an absolute matrix position
    pub fn cell(&self, height: usize, width: usize, row: usize, col: usize) -> (usize, usize) {
        let r = (row * height / self.rows.max(1)).min(height.saturating_sub(1));
        let c = (col * width / self.cols.max(1)).min(width.saturating_sub(1));
        (r, c)
    }
}

/// A correlation paired with the index of the matched subsequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Pearson correlation
    pub corr: f64,
    /// Absolute index of the matched subsequence
    pub index: u64,
}

impl Neighbor {
    /// Placeholder for a subsequence without a match
    pub const EMPTY: Neighbor = Neighbor {
        corr: f64::NEG_INFINITY,
        index: NO_MATCH,
    };

    /// Create a new neighbor
    pub fn new(corr: f64, index: u64) -> Self {
        Self { corr, index }
    }

    /// Whether this entry holds a real match
    pub fn is_match(&self) -> bool {
        self.index != NO_MATCH
    }

    /// Ranking: higher correlation first, smaller index on exact ties
    pub fn rank(&self, other: &Neighbor) -> Ordering {
        other
            .corr
            .partial_cmp(&self.corr)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }

    /// Whether this entry ranks strictly before `other`
    pub fn beats(&self, other: &Neighbor) -> bool {
        self.rank(other) == Ordering::Less
    }
}

/// Per-kind accumulator storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProfileData {
    /// One neighbor per subsequence
    NearestNeighbor(Vec<Neighbor>),
    /// Up to k neighbors per subsequence, ranked
    KNearest {
        /// Maximum list length
        k: usize,
        /// Ranked neighbor lists
        lists: Vec<Vec<Neighbor>>,
    },
    /// Correlation sums per subsequence
    ThresholdedSum(Vec<f64>),
    /// Row-major grid of maxima over the logical matrix
    PooledSummary {
        /// Grid rows
        height: usize,
        /// Grid columns
        width: usize,
        /// Logical matrix the grid is mapped onto
        extent: MatrixExtent,
        /// Cell maxima (`-inf` for cells without any evaluated pair)
        cells: Vec<f64>,
    },
}

/// Typed, windowed result buffer for one side of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileAccumulator {
    origin: usize,
    len: usize,
    data: ProfileData,
    finalized: bool,
}

impl ProfileAccumulator {
    /// Create an empty accumulator covering `[origin, origin + len)`.
    ///
    /// For [`ProfileKind::PooledSummary`] the window arguments are ignored;
    /// the grid always spans `extent`.
    pub fn new(kind: ProfileKind, origin: usize, len: usize, extent: MatrixExtent) -> Result<Self> {
        let data = match kind {
            ProfileKind::NearestNeighbor => ProfileData::NearestNeighbor(vec![Neighbor::EMPTY; len]),
            ProfileKind::KNearest { k } => {
                if k == 0 {
                    return Err(ScampError::validation("k must be at least 1"));
                }
                ProfileData::KNearest {
                    k,
                    lists: vec![Vec::new(); len],
                }
            }
            ProfileKind::ThresholdedSum => ProfileData::ThresholdedSum(vec![0.0; len]),
            ProfileKind::PooledSummary { height, width } => {
                if height == 0 || width == 0 {
                    return Err(ScampError::validation(
                        "pooled summary dimensions must be greater than 0",
                    ));
                }
                if extent.rows == 0 || extent.cols == 0 {
                    return Err(ScampError::validation("pooled summary extent is empty"));
                }
                return Ok(Self {
                    origin: 0,
                    len: height * width,
                    data: ProfileData::PooledSummary {
                        height,
                        width,
                        extent,
                        cells: vec![f64::NEG_INFINITY; height * width],
                    },
                    finalized: false,
                });
            }
        };

        Ok(Self {
            origin,
            len,
            data,
            finalized: false,
        })
    }

    /// Profile kind held by this accumulator
    pub fn kind(&self) -> ProfileKind {
        match &self.data {
            ProfileData::NearestNeighbor(_) => ProfileKind::NearestNeighbor,
            ProfileData::KNearest { k, .. } => ProfileKind::KNearest { k: *k },
            ProfileData::ThresholdedSum(_) => ProfileKind::ThresholdedSum,
            ProfileData::PooledSummary { height, width, .. } => ProfileKind::PooledSummary {
                height: *height,
                width: *width,
            },
        }
    }

    /// Absolute index of the first entry
    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the accumulator covers no entries
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw storage
    pub fn data(&self) -> &ProfileData {
        &self.data
    }

    /// Whether the accumulator has been sealed
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Seal the accumulator; further combines are rejected
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Merge a partial accumulator into this one.
    ///
    /// The partial must be of the same kind and its window must lie inside
    /// this accumulator's window.
    pub fn combine(&mut self, partial: &ProfileAccumulator) -> Result<()> {
        if self.finalized {
            return Err(ScampError::invalid_state(
                "cannot combine into a finalized accumulator",
            ));
        }
        if self.kind() != partial.kind() {
            return Err(ScampError::invalid_state(format!(
                "profile kind mismatch: {} vs {}",
                self.kind(),
                partial.kind()
            )));
        }

        let offset = if self.kind().is_pooled() {
            0
        } else {
            if partial.origin < self.origin || partial.origin + partial.len > self.origin + self.len {
                return Err(ScampError::invalid_state(format!(
                    "partial window [{}, {}) outside accumulator window [{}, {})",
                    partial.origin,
                    partial.origin + partial.len,
                    self.origin,
                    self.origin + self.len
                )));
            }
            partial.origin - self.origin
        };

        match (&mut self.data, &partial.data) {
            (ProfileData::NearestNeighbor(dst), ProfileData::NearestNeighbor(src)) => {
                for (d, s) in dst[offset..].iter_mut().zip(src) {
                    if s.beats(d) {
                        *d = *s;
                    }
                }
            }
            (ProfileData::KNearest { k, lists: dst }, ProfileData::KNearest { lists: src, .. }) => {
                for (d, s) in dst[offset..].iter_mut().zip(src) {
                    if !s.is_empty() {
                        merge_ranked(d, s, *k);
                    }
                }
            }
            (ProfileData::ThresholdedSum(dst), ProfileData::ThresholdedSum(src)) => {
                for (d, s) in dst[offset..].iter_mut().zip(src) {
                    *d += *s;
                }
            }
            (
                ProfileData::PooledSummary { extent, cells: dst, .. },
                ProfileData::PooledSummary {
                    extent: src_extent,
                    cells: src,
                    ..
                },
            ) => {
                if *extent != *src_extent {
                    return Err(ScampError::invalid_state(format!(
                        "pooled extent mismatch: {}x{} vs {}x{}",
                        extent.rows, extent.cols, src_extent.rows, src_extent.cols
                    )));
                }
                for (d, s) in dst.iter_mut().zip(src) {
                    if *s > *d {
                        *d = *s;
                    }
                }
            }
            _ => unreachable!("kinds checked above"),
        }

        Ok(())
    }

    /// Offer a candidate match for the subsequence at absolute `position`.
    ///
    /// Used by the kernel to fill fresh tile-local accumulators.
    pub(crate) fn offer(&mut self, position: usize, corr: f64, index: u64) {
        let slot = position - self.origin;
        match &mut self.data {
            ProfileData::NearestNeighbor(best) => {
                let candidate = Neighbor::new(corr, index);
                if candidate.beats(&best[slot]) {
                    best[slot] = candidate;
                }
            }
            ProfileData::KNearest { k, lists } => {
                insert_ranked(&mut lists[slot], Neighbor::new(corr, index), *k);
            }
            ProfileData::ThresholdedSum(sums) => sums[slot] += corr,
            ProfileData::PooledSummary { .. } => {}
        }
    }

    /// Offer a correlation for the absolute matrix position `(row, col)`.
    pub(crate) fn offer_cell(&mut self, row: usize, col: usize, corr: f64) {
        if let ProfileData::PooledSummary {
            height,
            width,
            extent,
            cells,
        } = &mut self.data
        {
            let (r, c) = extent.cell(*height, *width, row, col);
            let cell = &mut cells[r * *width + c];
            if corr > *cell {
                *cell = corr;
            }
        }
    }

    /// Current entry for the subsequence at absolute `position`, used by
    /// the kernel to decide whether a candidate can still matter.
    pub(crate) fn bar(&self, position: usize) -> f64 {
        let slot = position - self.origin;
        match &self.data {
            ProfileData::NearestNeighbor(best) => best[slot].corr,
            ProfileData::KNearest { k, lists } => {
                let list = &lists[slot];
                if list.len() < *k {
                    f64::NEG_INFINITY
                } else {
                    list[list.len() - 1].corr
                }
            }
            _ => f64::NEG_INFINITY,
        }
    }

    /// Current maximum of the pooled cell holding `(row, col)`
    pub(crate) fn cell_bar(&self, row: usize, col: usize) -> f64 {
        match &self.data {
            ProfileData::PooledSummary {
                height,
                width,
                extent,
                cells,
            } => {
                let (r, c) = extent.cell(*height, *width, row, col);
                cells[r * *width + c]
            }
            _ => f64::NEG_INFINITY,
        }
    }
}

/// Insert one candidate into a ranked list of at most `k` unique indices
fn insert_ranked(list: &mut Vec<Neighbor>, candidate: Neighbor, k: usize) {
    if let Some(pos) = list.iter().position(|n| n.index == candidate.index) {
        if !candidate.beats(&list[pos]) {
            return;
        }
        list.remove(pos);
    }
    if list.len() >= k && !candidate.beats(&list[list.len() - 1]) {
        return;
    }
    let at = list.partition_point(|n| n.beats(&candidate));
    list.insert(at, candidate);
    list.truncate(k);
}

/// Merge two ranked lists keeping the best entry per index, truncated to `k`
fn merge_ranked(dst: &mut Vec<Neighbor>, src: &[Neighbor], k: usize) {
    dst.extend_from_slice(src);
    dst.sort_by(|a, b| a.rank(b));
    let mut seen = std::collections::HashSet::with_capacity(dst.len());
    dst.retain(|n| seen.insert(n.index));
    dst.truncate(k);
}

/// Fold the column profile of a symmetric self-join into its row profile.
///
/// Afterwards both sides hold the same finalized profile. Must be applied
/// exactly once per job: sums are not idempotent.
pub fn fold_symmetric(
    rows: &mut ProfileAccumulator,
    cols: &mut ProfileAccumulator,
) -> Result<()> {
    if !rows.kind().is_pooled() {
        rows.combine(cols)?;
    }
    rows.finalize();
    *cols = rows.clone();
    Ok(())
}
