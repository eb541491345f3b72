//! Tile kernel
//!
//! Computes Pearson correlations for every pair of a tile and feeds them to
//! tile-local accumulators. Covariances are carried along each diagonal of
//! the correlation matrix with the centered update
//!
//! `cov[i+1][j+1] = cov[i][j] + df_a[i]*dg_b[j] + df_b[j]*dg_a[i]`
//!
//! where `df[i] = (x[i+m] - x[i]) / 2` and
//! `dg[i] = (x[i+m] - mu[i+1]) + (x[i] - mu[i])`.
//!
//! The recurrence restarts from an exact dot product whenever the absolute
//! row or column index is a multiple of [`REFRESH_INTERVAL`]. The value of
//! any pair therefore depends only on its absolute position, never on tile
//! or work range boundaries.

use super::{JobSpec, Precision, Tile};
use crate::error::{Result, ScampError};
use crate::profile::{MatrixExtent, ProfileAccumulator, ProfileKind};
use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Absolute stride at which covariances and window statistics are recomputed
pub const REFRESH_INTERVAL: usize = 64;

/// Mixed precision: single precision candidates this close to the decision
/// boundary are confirmed in double precision
pub const MIXED_BAND: f64 = 1e-3;

/// Floating point type a kernel sweep runs in
pub trait KernelFloat:
    Copy
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Send
    + Sync
    + 'static
{
    /// Additive identity
    const ZERO: Self;
    /// Multiplicative identity
    const ONE: Self;
    /// Relative variance floor under which a window counts as constant
    const CONSTANT_FLOOR: Self;
    /// Relative variance under which a rolled value is recomputed directly
    const RECHECK_FLOOR: Self;

    /// Convert from f64
    fn from_f64(v: f64) -> Self;
    /// Convert to f64
    fn to_f64(self) -> f64;
    /// Square root
    fn sqrt(self) -> Self;
}

impl KernelFloat for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const CONSTANT_FLOOR: Self = 1e-20;
    const RECHECK_FLOOR: Self = 1e-8;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
}

impl KernelFloat for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const CONSTANT_FLOOR: Self = 1e-10;
    const RECHECK_FLOOR: Self = 1e-3;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
}

/// Distance back from local index `x` to the nearest refresh point
fn refresh_distance(offset: usize, x: usize) -> usize {
    x.min((offset + x) % REFRESH_INTERVAL)
}

/// Per-subsequence statistics of one series slice
#[derive(Debug, Clone)]
pub struct SeriesStats<T: KernelFloat> {
    values: Vec<T>,
    mu: Vec<T>,
    /// `1 / sqrt(sum((x - mu)^2))`, zero for constant windows
    norm: Vec<T>,
    df: Vec<T>,
    dg: Vec<T>,
    offset: usize,
}

impl<T: KernelFloat> SeriesStats<T> {
    /// Compute statistics for `series` whose first point sits at absolute
    /// index `offset`
    pub fn new(series: &[f64], window: usize, offset: usize) -> Self {
        let values: Vec<T> = series.iter().map(|&v| T::from_f64(v)).collect();
        let n = (values.len() + 1).saturating_sub(window);
        let m = T::from_f64(window as f64);

        let mut mu = Vec::with_capacity(n);
        let mut norm = Vec::with_capacity(n);
        let mut sum = T::ZERO;
        let mut ssd = T::ZERO;

        for i in 0..n {
            if refresh_distance(offset, i) == 0 {
                sum = values[i..i + window].iter().fold(T::ZERO, |acc, &v| acc + v);
                let mean = sum / m;
                ssd = values[i..i + window]
                    .iter()
                    .fold(T::ZERO, |acc, &v| acc + (v - mean) * (v - mean));
                mu.push(mean);
            } else {
                let old = values[i - 1];
                let new = values[i + window - 1];
                let prev = mu[i - 1];
                sum = sum - old + new;
                let mean = sum / m;
                ssd = ssd + (new - old) * (new + old - mean - prev);
                mu.push(mean);
            }

            let mean = mu[i];
            let scale = if mean * mean > T::ONE { mean * mean } else { T::ONE };
            if ssd <= T::RECHECK_FLOOR * m * scale {
                // Rolled variance lost too many digits; redo this window exactly
                sum = values[i..i + window].iter().fold(T::ZERO, |acc, &v| acc + v);
                let exact_mean = sum / m;
                ssd = values[i..i + window]
                    .iter()
                    .fold(T::ZERO, |acc, &v| acc + (v - exact_mean) * (v - exact_mean));
                mu[i] = exact_mean;
            }
            if ssd > T::CONSTANT_FLOOR * m * scale {
                norm.push(T::ONE / ssd.sqrt());
            } else {
                norm.push(T::ZERO);
            }
        }

        let steps = n.saturating_sub(1);
        let half = T::from_f64(0.5);
        let mut df = Vec::with_capacity(steps);
        let mut dg = Vec::with_capacity(steps);
        for i in 0..steps {
            let new = values[i + window];
            let old = values[i];
            df.push((new - old) * half);
            dg.push((new - mu[i + 1]) + (old - mu[i]));
        }

        Self {
            values,
            mu,
            norm,
            df,
            dg,
            offset,
        }
    }

    /// Number of subsequences
    pub fn len(&self) -> usize {
        self.mu.len()
    }

    /// Whether the slice holds no subsequence
    pub fn is_empty(&self) -> bool {
        self.mu.is_empty()
    }

    /// Whether subsequence `i` has zero variance
    pub fn is_constant(&self, i: usize) -> bool {
        self.norm[i] == T::ZERO
    }

    fn refresh_distance(&self, i: usize) -> usize {
        refresh_distance(self.offset, i)
    }
}

/// Exact centered dot product of `a[i..i+m]` and `b[j..j+m]`
fn direct_cov<T: KernelFloat>(a: &SeriesStats<T>, b: &SeriesStats<T>, i: usize, j: usize, window: usize) -> T {
    let (ma, mb) = (a.mu[i], b.mu[j]);
    a.values[i..i + window]
        .iter()
        .zip(&b.values[j..j + window])
        .fold(T::ZERO, |acc, (&x, &y)| acc + (x - ma) * (y - mb))
}

/// Everything the kernel needs to compute tiles of one job unit
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Subsequence length
    pub window: usize,
    /// Absolute index of the first row
    pub row_offset: usize,
    /// Absolute index of the first column
    pub col_offset: usize,
    /// Number of row subsequences
    pub n_rows: usize,
    /// Number of column subsequences
    pub n_cols: usize,
    /// Trivial-match exclusion half-width
    pub exclusion_zone: Option<usize>,
    /// Upper triangle only
    pub symmetric: bool,
    /// Pooled cells are written at both `(r, c)` and `(c, r)`
    pub mirror_cells: bool,
    /// Correlation threshold
    pub threshold: f64,
    /// Statistic being computed
    pub kind: ProfileKind,
    /// Logical matrix size, for pooled summaries
    pub extent: MatrixExtent,
    /// Numeric policy
    pub precision: Precision,
    /// Produce row contributions
    pub wants_rows: bool,
    /// Produce column contributions
    pub wants_cols: bool,
    a64: SeriesStats<f64>,
    b64: Option<SeriesStats<f64>>,
    a32: Option<SeriesStats<f32>>,
    b32: Option<SeriesStats<f32>>,
}

impl UnitContext {
    /// Precompute window statistics for a validated job unit
    pub fn new(spec: &JobSpec) -> Result<Self> {
        spec.validate()?;
        let window = spec.window;
        let (row_offset, col_offset) = (spec.row_offset(), spec.col_offset());
        let single = spec.precision != Precision::Double;
        let same_series = spec.series_b.is_none();

        let a64 = SeriesStats::new(&spec.series_a, window, row_offset);
        let b64 = spec
            .series_b
            .as_ref()
            .map(|b| SeriesStats::new(b, window, col_offset));
        let a32 = single.then(|| SeriesStats::new(&spec.series_a, window, row_offset));
        let b32 = if single && !same_series {
            Some(SeriesStats::new(spec.series_b(), window, col_offset))
        } else {
            None
        };

        Ok(Self {
            window,
            row_offset,
            col_offset,
            n_rows: spec.n_rows(),
            n_cols: spec.n_cols(),
            exclusion_zone: spec.exclusion_zone(),
            symmetric: spec.is_symmetric(),
            mirror_cells: spec.self_join && !spec.keep_rows_separate,
            threshold: spec.distance_threshold,
            kind: spec.profile_kind,
            extent: spec.extent(),
            precision: spec.precision,
            wants_rows: spec.wants_rows(),
            wants_cols: spec.wants_columns(),
            a64,
            b64,
            a32,
            b32,
        })
    }

    fn b64(&self) -> &SeriesStats<f64> {
        self.b64.as_ref().unwrap_or(&self.a64)
    }

    fn single_stats(&self) -> Result<(&SeriesStats<f32>, &SeriesStats<f32>)> {
        let a = self
            .a32
            .as_ref()
            .ok_or_else(|| ScampError::invalid_state("single precision statistics missing"))?;
        Ok((a, self.b32.as_ref().unwrap_or(a)))
    }

    /// Double precision correlation of the unit-local pair `(r, c)`, or
    /// `None` when either window is constant
    pub fn exact_correlation(&self, r: usize, c: usize) -> Option<f64> {
        let (a, b) = (&self.a64, self.b64());
        if a.is_constant(r) || b.is_constant(c) {
            return None;
        }
        let cov = direct_cov(a, b, r, c, self.window);
        Some((cov * a.norm[r] * b.norm[c]).clamp(-1.0, 1.0))
    }

    /// Whether the diagonal `c - r = d` (unit-local) is skipped entirely
    fn skips_diagonal(&self, tile: &Tile, r0: usize, c0: usize) -> bool {
        if tile.diagonal && c0 <= r0 {
            return true;
        }
        match self.exclusion_zone {
            Some(zone) => {
                let abs_r = self.row_offset + r0;
                let abs_c = self.col_offset + c0;
                abs_r.abs_diff(abs_c) <= zone
            }
            None => false,
        }
    }
}

/// Tile-local partial accumulators
#[derive(Debug, Clone)]
pub struct TileOutput {
    /// Plan position of the tile
    pub tile_id: usize,
    /// Row side (also holds the pooled grid)
    pub rows: Option<ProfileAccumulator>,
    /// Column side
    pub cols: Option<ProfileAccumulator>,
}

impl TileOutput {
    /// Empty partials sized for `tile`
    pub fn empty(unit: &UnitContext, tile: &Tile) -> Result<Self> {
        let rows = if unit.wants_rows {
            Some(ProfileAccumulator::new(
                unit.kind,
                unit.row_offset + tile.row_start,
                tile.rows(),
                unit.extent,
            )?)
        } else {
            None
        };
        let cols = if unit.wants_cols {
            Some(ProfileAccumulator::new(
                unit.kind,
                unit.col_offset + tile.col_start,
                tile.cols(),
                unit.extent,
            )?)
        } else {
            None
        };
        Ok(Self {
            tile_id: tile.id,
            rows,
            cols,
        })
    }

    /// Merge another partial of the same tile region
    pub fn merge(&mut self, other: &TileOutput) -> Result<()> {
        if let (Some(dst), Some(src)) = (&mut self.rows, &other.rows) {
            dst.combine(src)?;
        }
        if let (Some(dst), Some(src)) = (&mut self.cols, &other.cols) {
            dst.combine(src)?;
        }
        Ok(())
    }

    fn visit(&mut self, unit: &UnitContext, r: usize, c: usize, approx: f64) {
        let abs_r = unit.row_offset + r;
        let abs_c = unit.col_offset + c;
        let mut corr = approx.clamp(-1.0, 1.0);
        let mixed = unit.precision == Precision::Mixed;

        match unit.kind {
            ProfileKind::NearestNeighbor | ProfileKind::KNearest { .. } => {
                let knn = matches!(unit.kind, ProfileKind::KNearest { .. });
                if mixed {
                    let row_bar = self.rows.as_ref().map_or(f64::INFINITY, |a| a.bar(abs_r));
                    let col_bar = self.cols.as_ref().map_or(f64::INFINITY, |a| a.bar(abs_c));
                    let mut floor = row_bar.min(col_bar);
                    if knn {
                        floor = floor.max(unit.threshold);
                    }
                    if corr < floor - MIXED_BAND {
                        return;
                    }
                    match unit.exact_correlation(r, c) {
                        Some(exact) => corr = exact,
                        None => return,
                    }
                }
                if knn && corr <= unit.threshold {
                    return;
                }
                if let Some(rows) = &mut self.rows {
                    rows.offer(abs_r, corr, abs_c as u64);
                }
                if let Some(cols) = &mut self.cols {
                    cols.offer(abs_c, corr, abs_r as u64);
                }
            }
            ProfileKind::ThresholdedSum => {
                if mixed && (corr - unit.threshold).abs() < MIXED_BAND {
                    match unit.exact_correlation(r, c) {
                        Some(exact) => corr = exact,
                        None => return,
                    }
                }
                if corr <= unit.threshold {
                    return;
                }
                if let Some(rows) = &mut self.rows {
                    rows.offer(abs_r, corr, abs_c as u64);
                }
                if let Some(cols) = &mut self.cols {
                    cols.offer(abs_c, corr, abs_r as u64);
                }
            }
            ProfileKind::PooledSummary { .. } => {
                let Some(grid) = &mut self.rows else {
                    return;
                };
                if mixed {
                    let mut bar = grid.cell_bar(abs_r, abs_c);
                    if unit.mirror_cells {
                        bar = bar.min(grid.cell_bar(abs_c, abs_r));
                    }
                    if corr < bar - MIXED_BAND {
                        return;
                    }
                    match unit.exact_correlation(r, c) {
                        Some(exact) => corr = exact,
                        None => return,
                    }
                }
                grid.offer_cell(abs_r, abs_c, corr);
                if unit.mirror_cells {
                    grid.offer_cell(abs_c, abs_r, corr);
                }
            }
        }
    }
}

/// Walk every diagonal crossing `tile` and visit its valid pairs
fn sweep<T: KernelFloat>(
    unit: &UnitContext,
    a: &SeriesStats<T>,
    b: &SeriesStats<T>,
    tile: &Tile,
    out: &mut TileOutput,
) {
    let m = unit.window;
    let starts = (tile.col_start..tile.col_end)
        .map(|c| (tile.row_start, c))
        .chain((tile.row_start + 1..tile.row_end).map(|r| (r, tile.col_start)));

    for (r0, c0) in starts {
        if unit.skips_diagonal(tile, r0, c0) {
            continue;
        }
        let len = (tile.row_end - r0).min(tile.col_end - c0);

        // Roll forward from the nearest refresh point behind the start
        let back = a.refresh_distance(r0).min(b.refresh_distance(c0));
        let (mut i, mut j) = (r0 - back, c0 - back);
        let mut cov = direct_cov(a, b, i, j, m);
        while i < r0 {
            cov = cov + a.df[i] * b.dg[j] + b.df[j] * a.dg[i];
            i += 1;
            j += 1;
        }

        for t in 0..len {
            let (r, c) = (r0 + t, c0 + t);
            if t > 0 {
                cov = if a.refresh_distance(r) == 0 || b.refresh_distance(c) == 0 {
                    direct_cov(a, b, r, c, m)
                } else {
                    cov + a.df[r - 1] * b.dg[c - 1] + b.df[c - 1] * a.dg[r - 1]
                };
            }
            if a.is_constant(r) || b.is_constant(c) {
                continue;
            }
            let corr = (cov * a.norm[r] * b.norm[c]).to_f64();
            out.visit(unit, r, c, corr);
        }
    }
}

/// Compute one tile on the calling thread
pub fn compute_tile(unit: &UnitContext, tile: &Tile) -> Result<TileOutput> {
    let mut out = TileOutput::empty(unit, tile)?;
    match unit.precision {
        Precision::Double => sweep(unit, &unit.a64, unit.b64(), tile, &mut out),
        Precision::Mixed | Precision::Single => {
            let (a, b) = unit.single_stats()?;
            sweep(unit, a, b, tile, &mut out);
        }
    }
    Ok(out)
}

/// Split a tile into at most `parts` row bands
pub fn split_rows(tile: &Tile, parts: usize) -> Vec<Tile> {
    let parts = parts.clamp(1, tile.rows().max(1));
    let band = tile.rows().div_ceil(parts).max(1);
    (tile.row_start..tile.row_end)
        .step_by(band)
        .map(|start| Tile {
            row_start: start,
            row_end: (start + band).min(tile.row_end),
            ..*tile
        })
        .collect()
}

/// Compute one tile with its rows spread across a rayon pool
pub fn compute_tile_parallel(unit: &UnitContext, tile: &Tile, pool: &rayon::ThreadPool) -> Result<TileOutput> {
    let bands = split_rows(tile, pool.current_num_threads());
    if bands.len() <= 1 {
        return compute_tile(unit, tile);
    }

    let partials: Vec<Result<TileOutput>> =
        pool.install(|| bands.par_iter().map(|band| compute_tile(unit, band)).collect());

    let mut out = TileOutput::empty(unit, tile)?;
    for partial in partials {
        out.merge(&partial?)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TilePlan;
    use crate::profile::{Neighbor, ProfileData};

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                (t * 0.21).sin() + 0.4 * (t * 0.057).cos() + 0.05 * ((i * 7919) % 13) as f64
            })
            .collect()
    }

    fn naive_corr(a: &[f64], b: &[f64]) -> f64 {
        let m = a.len() as f64;
        let ma = a.iter().sum::<f64>() / m;
        let mb = b.iter().sum::<f64>() / m;
        let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
        let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
        let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
        cov / (va.sqrt() * vb.sqrt())
    }

    fn nn(out: &ProfileAccumulator) -> Vec<Neighbor> {
        match out.data() {
            ProfileData::NearestNeighbor(v) => v.clone(),
            _ => panic!("unexpected data"),
        }
    }

    fn full_tile(unit: &UnitContext) -> Tile {
        TilePlan::new(unit.n_rows, unit.n_cols, unit.window, usize::MAX, false)
            .next()
            .unwrap()
    }

    #[test]
    fn test_ab_join_matches_naive() {
        let a = wave(300);
        let b: Vec<f64> = wave(260).into_iter().map(|v| 3.0 * v - 7.0).collect();
        let m = 16;
        let unit = UnitContext::new(&JobSpec::ab_join(a.clone(), b.clone(), m)).unwrap();
        let out = compute_tile(&unit, &full_tile(&unit)).unwrap();

        let rows = nn(out.rows.as_ref().unwrap());
        for (r, best) in rows.iter().enumerate().step_by(17) {
            let expected = (0..unit.n_cols)
                .map(|c| naive_corr(&a[r..r + m], &b[c..c + m]))
                .fold(f64::NEG_INFINITY, f64::max);
            assert!((best.corr - expected).abs() < 1e-9, "row {}: {} vs {}", r, best.corr, expected);
        }
    }

    #[test]
    fn test_values_independent_of_tiling() {
        let spec = JobSpec::ab_join(wave(400), wave(350), 12);
        let unit = UnitContext::new(&spec).unwrap();

        let whole = compute_tile(&unit, &full_tile(&unit)).unwrap();
        let mut tiled = TileOutput::empty(&unit, &full_tile(&unit)).unwrap();
        for tile in TilePlan::new(unit.n_rows, unit.n_cols, 12, 45, false) {
            tiled.merge(&compute_tile(&unit, &tile).unwrap()).unwrap();
        }

        assert_eq!(nn(whole.rows.as_ref().unwrap()), nn(tiled.rows.as_ref().unwrap()));
    }

    #[test]
    fn test_exclusion_zone_and_constant_windows() {
        let mut series = wave(120);
        for v in &mut series[40..60] {
            *v = 2.5;
        }
        let spec = JobSpec::self_join(series, 8);
        let unit = UnitContext::new(&spec).unwrap();
        let out = compute_tile(&unit, &full_tile(&unit)).unwrap();

        let zone = spec.exclusion_zone().unwrap() as u64;
        let rows = nn(out.rows.as_ref().unwrap());
        for (r, best) in rows.iter().enumerate() {
            if best.is_match() {
                assert!(best.index.abs_diff(r as u64) > zone);
            }
        }
        // Windows fully inside the flat region have no match
        assert!(!rows[45].is_match());
    }

    #[test]
    fn test_precision_policies_within_tolerance() {
        let a = wave(256);
        let reference = {
            let unit = UnitContext::new(&JobSpec::self_join(a.clone(), 20)).unwrap();
            nn(compute_tile(&unit, &full_tile(&unit)).unwrap().rows.as_ref().unwrap())
        };

        for precision in [Precision::Mixed, Precision::Single] {
            let spec = JobSpec::self_join(a.clone(), 20).with_precision(precision);
            let unit = UnitContext::new(&spec).unwrap();
            let rows = nn(compute_tile(&unit, &full_tile(&unit)).unwrap().rows.as_ref().unwrap());
            for (x, y) in rows.iter().zip(&reference) {
                assert!(
                    (x.corr - y.corr).abs() <= precision.tolerance(),
                    "{}: {} vs {}",
                    precision,
                    x.corr,
                    y.corr
                );
            }
        }
    }

    /// AB-join inputs riding on a large offset, where f32 cancellation shows
    fn offset_join(kind: ProfileKind, threshold: f64, precision: Precision) -> TileOutput {
        let a: Vec<f64> = wave(700).into_iter().map(|v| v + 1000.0).collect();
        let b: Vec<f64> = wave(640).into_iter().rev().map(|v| 0.5 * v + 1000.0).collect();
        let spec = JobSpec::ab_join(a, b, 50)
            .with_kind(kind)
            .with_threshold(threshold)
            .with_precision(precision);
        let unit = UnitContext::new(&spec).unwrap();
        compute_tile(&unit, &full_tile(&unit)).unwrap()
    }

    #[test]
    fn test_knn_precision_within_tolerance() {
        let kind = ProfileKind::KNearest { k: 3 };
        let lists = |out: TileOutput| match out.rows.unwrap().data() {
            ProfileData::KNearest { lists, .. } => lists
                .iter()
                .map(|l| {
                    let mut v: Vec<f64> = l.iter().map(|n| n.corr).collect();
                    v.sort_by(|x, y| y.total_cmp(x));
                    v
                })
                .collect::<Vec<_>>(),
            other => panic!("unexpected data: {:?}", other),
        };
        let reference = lists(offset_join(kind, 0.0, Precision::Double));

        for precision in [Precision::Mixed, Precision::Single] {
            let rows = lists(offset_join(kind, 0.0, precision));
            for (r, (x, y)) in rows.iter().zip(&reference).enumerate() {
                assert_eq!(x.len(), y.len(), "{} row {}", precision, r);
                for (p, q) in x.iter().zip(y) {
                    assert!((p - q).abs() <= precision.tolerance(), "{} row {}: {} vs {}", precision, r, p, q);
                }
            }
        }
    }

    #[test]
    fn test_thresholded_sum_precision_within_tolerance() {
        let sums = |out: TileOutput| match out.rows.unwrap().data() {
            ProfileData::ThresholdedSum(v) => v.clone(),
            other => panic!("unexpected data: {:?}", other),
        };
        // 591 columns; every term differs by at most the per-value tolerance.
        // Mixed confirms candidates near the threshold, so membership is exact.
        // Single may flip candidates near a zero threshold, which moves a sum
        // by at most the tolerance as well.
        let n_cols = 591.0;
        for (precision, threshold) in [(Precision::Mixed, 0.5), (Precision::Single, 0.0)] {
            let reference = sums(offset_join(ProfileKind::ThresholdedSum, threshold, Precision::Double));
            let rows = sums(offset_join(ProfileKind::ThresholdedSum, threshold, precision));
            assert!(reference.iter().any(|v| *v > 0.0));
            for (r, (x, y)) in rows.iter().zip(&reference).enumerate() {
                assert!(
                    (x - y).abs() <= n_cols * precision.tolerance(),
                    "{} row {}: {} vs {}",
                    precision,
                    r,
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn test_pooled_summary_precision_within_tolerance() {
        let kind = ProfileKind::PooledSummary { height: 7, width: 6 };
        let cells = |out: TileOutput| match out.rows.unwrap().data() {
            ProfileData::PooledSummary { cells, .. } => cells.clone(),
            other => panic!("unexpected data: {:?}", other),
        };
        let reference = cells(offset_join(kind, 0.0, Precision::Double));
        assert!(reference.iter().all(|v| v.is_finite()));

        for precision in [Precision::Mixed, Precision::Single] {
            let grid = cells(offset_join(kind, 0.0, precision));
            for (x, y) in grid.iter().zip(&reference) {
                assert!((x - y).abs() <= precision.tolerance(), "{}: {} vs {}", precision, x, y);
            }
        }
    }

    #[test]
    fn test_split_rows() {
        let tile = Tile {
            id: 3,
            row_start: 10,
            row_end: 21,
            col_start: 0,
            col_end: 5,
            diagonal: false,
        };
        let bands = split_rows(&tile, 4);
        assert_eq!(bands.len(), 4);
        assert_eq!(bands[0].row_start, 10);
        assert_eq!(bands.last().unwrap().row_end, 21);
        assert!(bands.iter().all(|b| b.id == 3));
        assert_eq!(split_rows(&tile, 100).len(), 11);
    }

    #[test]
    fn test_parallel_tile_matches_sequential() {
        let spec = JobSpec::self_join(wave(300), 10).with_kind(ProfileKind::KNearest { k: 3 });
        let unit = UnitContext::new(&spec).unwrap();
        let tile = TilePlan::for_spec(&spec).next().unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();

        let seq = compute_tile(&unit, &tile).unwrap();
        let par = compute_tile_parallel(&unit, &tile, &pool).unwrap();
        assert_eq!(seq.rows, par.rows);
        assert_eq!(seq.cols, par.cols);
    }
}
