//! Compute options
//!
//! Keyword-style options accepted by the join facades, validated one key at
//! a time. Unknown keys and values of the wrong type are rejected before
//! any computation starts.

use crate::core::{JobSpec, Precision, DEFAULT_K, DEFAULT_MATRIX_DIM, DEFAULT_MAX_TILE_SIZE};
use crate::error::{Result, ScampError};
use crate::profile::ProfileKind;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Profile type requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum ProfileType {
    /// Nearest neighbor profile
    #[default]
    #[value(name = "nn")]
    NearestNeighbor,
    /// k nearest neighbors per subsequence
    #[value(name = "knn")]
    KNearest,
    /// Sum of correlations above the threshold
    #[value(name = "sum")]
    Sum,
    /// Pooled matrix summary
    #[value(name = "matrix")]
    Matrix,
}

/// A single option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Text(String),
    /// List of integers
    IntList(Vec<i64>),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Float(_) => "float",
            OptionValue::Text(_) => "string",
            OptionValue::IntList(_) => "list",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Text(v) => write!(f, "{}", v),
            OptionValue::IntList(v) => write!(f, "{:?}", v),
        }
    }
}

fn wrong_type(key: &str, expected: &str, value: &OptionValue) -> ScampError {
    ScampError::validation(format!(
        "option '{}' expects {} (got {} {})",
        key,
        expected,
        value.type_name(),
        value
    ))
}

/// Options for a local or distributed join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOptions {
    /// Correlation threshold for sums and k-nearest lists
    pub threshold: f64,
    /// Suppress progress output
    pub silent: bool,
    /// Pooled summary grid rows
    pub mheight: usize,
    /// Pooled summary grid columns
    pub mwidth: usize,
    /// Neighbors kept for k-nearest profiles
    pub k: usize,
    /// Kernel precision policy
    pub precision: Precision,
    /// Report correlations instead of z-normalized Euclidean distances
    pub pearson: bool,
    /// Device ids to run on
    pub gpus: Vec<i32>,
    /// CPU worker group size (0 = default resource selection)
    pub threads: usize,
    /// Maximum tile edge
    pub max_tile_size: usize,
    /// Keep row and column profiles separate
    pub keep_rows_separate: bool,
    /// Apply the exclusion zone to AB-joins
    pub aligned: bool,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            silent: true,
            mheight: DEFAULT_MATRIX_DIM,
            mwidth: DEFAULT_MATRIX_DIM,
            k: DEFAULT_K,
            precision: Precision::Double,
            pearson: false,
            gpus: Vec::new(),
            threads: 0,
            max_tile_size: DEFAULT_MAX_TILE_SIZE,
            keep_rows_separate: false,
            aligned: false,
        }
    }
}

impl ComputeOptions {
    /// Build options from key/value pairs
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, OptionValue)>,
        K: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.apply(key.as_ref(), value)?;
        }
        Ok(options)
    }

    /// Apply one keyword option
    pub fn apply(&mut self, key: &str, value: OptionValue) -> Result<()> {
        match key {
            "threshold" => {
                let threshold = match value {
                    OptionValue::Float(v) => v,
                    OptionValue::Int(v) => v as f64,
                    ref other => return Err(wrong_type(key, "a number", other)),
                };
                if !(-1.0..=1.0).contains(&threshold) {
                    return Err(ScampError::validation(format!(
                        "threshold must be within [-1, 1] (got {})",
                        threshold
                    )));
                }
                self.threshold = threshold;
            }
            "verbose" => match value {
                OptionValue::Bool(v) => self.silent = !v,
                ref other => return Err(wrong_type(key, "a bool", other)),
            },
            "mheight" | "mwidth" => {
                let dim = match value {
                    OptionValue::Int(v) if v > 0 => v as usize,
                    OptionValue::Int(v) => {
                        return Err(ScampError::validation(format!(
                            "{} must be greater than 0 (got {})",
                            key, v
                        )))
                    }
                    ref other => return Err(wrong_type(key, "an int", other)),
                };
                if key == "mheight" {
                    self.mheight = dim;
                } else {
                    self.mwidth = dim;
                }
            }
            "precision" => match value {
                OptionValue::Text(ref v) => self.precision = v.parse()?,
                ref other => return Err(wrong_type(key, "a string", other)),
            },
            "pearson" => match value {
                OptionValue::Bool(v) => self.pearson = v,
                ref other => return Err(wrong_type(key, "a bool", other)),
            },
            "gpus" => match value {
                OptionValue::IntList(ids) => {
                    self.gpus = ids
                        .into_iter()
                        .map(|id| {
                            i32::try_from(id).map_err(|_| {
                                ScampError::validation(format!("invalid GPU id {}", id))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                }
                ref other => return Err(wrong_type(key, "a list of ints", other)),
            },
            "threads" => match value {
                OptionValue::Int(v) if v >= 0 => self.threads = v as usize,
                OptionValue::Int(v) => {
                    return Err(ScampError::validation(format!(
                        "threads must be at least 0 (got {})",
                        v
                    )))
                }
                ref other => return Err(wrong_type(key, "an int", other)),
            },
            unknown => {
                return Err(ScampError::validation(format!(
                    "unknown option '{}'",
                    unknown
                )))
            }
        }
        Ok(())
    }

    /// Concrete profile kind for a requested type
    pub fn profile_kind(&self, profile: ProfileType) -> ProfileKind {
        match profile {
            ProfileType::NearestNeighbor => ProfileKind::NearestNeighbor,
            ProfileType::KNearest => ProfileKind::KNearest { k: self.k },
            ProfileType::Sum => ProfileKind::ThresholdedSum,
            ProfileType::Matrix => ProfileKind::PooledSummary {
                height: self.mheight,
                width: self.mwidth,
            },
        }
    }

    /// Copy the job-level options onto a spec
    pub fn apply_to(&self, mut spec: JobSpec, profile: ProfileType) -> JobSpec {
        spec.profile_kind = self.profile_kind(profile);
        spec.distance_threshold = self.threshold;
        spec.precision = self.precision;
        spec.silent = self.silent;
        spec.max_tile_size = self.max_tile_size;
        spec.keep_rows_separate = self.keep_rows_separate;
        spec.is_aligned = self.aligned;
        spec
    }
}
