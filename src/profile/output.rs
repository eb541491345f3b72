//! User-facing profile shapes
//!
//! Converts finalized accumulators into the plain arrays returned to
//! callers, optionally translating correlations into z-normalized
//! Euclidean distances.

use super::{ProfileAccumulator, ProfileData};
use serde::{Deserialize, Serialize};

/// Z-normalized Euclidean distance for a Pearson correlation over windows
/// of length `window`: `sqrt(2 * m * (1 - r))`
pub fn pearson_to_euclidean(corr: f64, window: usize) -> f64 {
    if corr.is_nan() {
        return f64::NAN;
    }
    (2.0 * window as f64 * (1.0 - corr.clamp(-1.0, 1.0))).sqrt()
}

/// One entry of a k-nearest-neighbor profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnnMatch {
    /// Subsequence the match belongs to
    pub source_index: u64,
    /// Matched subsequence
    pub match_index: u64,
    /// Correlation or distance
    pub value: f64,
}

/// Pooled summary grid, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledMatrix {
    /// Grid rows
    pub height: usize,
    /// Grid columns
    pub width: usize,
    /// Cell values (NaN for cells without any evaluated pair)
    pub values: Vec<f64>,
}

impl PooledMatrix {
    /// Value of cell `(row, col)`
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.height && col < self.width {
            Some(self.values[row * self.width + col])
        } else {
            None
        }
    }

    /// Rows of the grid
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.width.max(1))
    }
}

/// Profile in the shape returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileOutput {
    /// Best value and matching index per subsequence (`-1` and NaN when
    /// there is no valid match)
    NearestNeighbor {
        /// Correlations or distances
        values: Vec<f64>,
        /// Matched subsequence indices
        indices: Vec<i64>,
    },
    /// Flat list of matches
    KNearest {
        /// Matches ordered by source, then rank
        matches: Vec<KnnMatch>,
    },
    /// Sum of correlations above the threshold per subsequence
    ThresholdedSum {
        /// Sums
        values: Vec<f64>,
    },
    /// Pooled summary grid
    PooledSummary(PooledMatrix),
}

impl ProfileOutput {
    /// Convert an accumulator. With `pearson == false` correlations are
    /// reported as Euclidean distances; sums are always correlations.
    pub fn from_accumulator(acc: &ProfileAccumulator, window: usize, pearson: bool) -> Self {
        let convert = |corr: f64| {
            if pearson {
                corr
            } else {
                pearson_to_euclidean(corr, window)
            }
        };

        match acc.data() {
            ProfileData::NearestNeighbor(best) => {
                let (values, indices) = best
                    .iter()
                    .map(|n| {
                        if n.is_match() {
                            (convert(n.corr), n.index as i64)
                        } else {
                            (f64::NAN, -1)
                        }
                    })
                    .unzip();
                ProfileOutput::NearestNeighbor { values, indices }
            }
            ProfileData::KNearest { lists, .. } => {
                let matches = lists
                    .iter()
                    .enumerate()
                    .flat_map(|(i, list)| {
                        let source = (acc.origin() + i) as u64;
                        list.iter().map(move |n| (source, *n))
                    })
                    .map(|(source, n)| KnnMatch {
                        source_index: source,
                        match_index: n.index,
                        value: convert(n.corr),
                    })
                    .collect();
                ProfileOutput::KNearest { matches }
            }
            ProfileData::ThresholdedSum(sums) => ProfileOutput::ThresholdedSum {
                values: sums.clone(),
            },
            ProfileData::PooledSummary {
                height,
                width,
                cells,
                ..
            } => ProfileOutput::PooledSummary(PooledMatrix {
                height: *height,
                width: *width,
                values: cells
                    .iter()
                    .map(|&c| if c == f64::NEG_INFINITY { f64::NAN } else { convert(c) })
                    .collect(),
            }),
        }
    }

    /// Number of entries (subsequences, matches or cells)
    pub fn len(&self) -> usize {
        match self {
            ProfileOutput::NearestNeighbor { values, .. } => values.len(),
            ProfileOutput::KNearest { matches } => matches.len(),
            ProfileOutput::ThresholdedSum { values } => values.len(),
            ProfileOutput::PooledSummary(matrix) => matrix.values.len(),
        }
    }

    /// Whether the output holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MatrixExtent, ProfileKind};

    #[test]
    fn test_pearson_to_euclidean() {
        assert_eq!(pearson_to_euclidean(1.0, 10), 0.0);
        assert!((pearson_to_euclidean(-1.0, 10) - 40f64.sqrt()).abs() < 1e-12);
        assert!((pearson_to_euclidean(0.0, 8) - 4.0).abs() < 1e-12);
        assert!(pearson_to_euclidean(f64::NAN, 8).is_nan());
    }

    #[test]
    fn test_nearest_neighbor_output() {
        let mut acc = ProfileAccumulator::new(ProfileKind::NearestNeighbor, 0, 3, MatrixExtent::new(3, 3)).unwrap();
        acc.offer(0, 1.0, 2);
        acc.offer(2, 0.5, 0);

        match ProfileOutput::from_accumulator(&acc, 4, false) {
            ProfileOutput::NearestNeighbor { values, indices } => {
                assert_eq!(indices, vec![2, -1, 0]);
                assert_eq!(values[0], 0.0);
                assert!(values[1].is_nan());
                assert!((values[2] - 2.0).abs() < 1e-12);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_knn_output_uses_absolute_sources() {
        let mut acc = ProfileAccumulator::new(ProfileKind::KNearest { k: 2 }, 5, 2, MatrixExtent::new(9, 9)).unwrap();
        acc.offer(6, 0.9, 1);
        acc.offer(6, 0.8, 0);
        acc.offer(6, 0.7, 3);

        match ProfileOutput::from_accumulator(&acc, 4, true) {
            ProfileOutput::KNearest { matches } => {
                assert_eq!(matches.len(), 2);
                assert_eq!(matches[0], KnnMatch { source_index: 6, match_index: 1, value: 0.9 });
                assert_eq!(matches[1].match_index, 0);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_pooled_output_marks_empty_cells() {
        let mut acc = ProfileAccumulator::new(
            ProfileKind::PooledSummary { height: 2, width: 2 },
            0,
            0,
            MatrixExtent::new(4, 4),
        )
        .unwrap();
        acc.offer_cell(3, 0, 0.5);

        match ProfileOutput::from_accumulator(&acc, 4, true) {
            ProfileOutput::PooledSummary(matrix) => {
                assert_eq!(matrix.get(1, 0), Some(0.5));
                assert!(matrix.get(0, 0).unwrap().is_nan());
                assert_eq!(matrix.get(2, 0), None);
                assert_eq!(matrix.rows().count(), 2);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
