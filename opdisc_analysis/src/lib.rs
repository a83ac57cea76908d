//! Analysis core for opinion-dynamics multiverse output: turning-point
//! detection, group partitioning of per-agent data, and the summaries the
//! plotting layer builds on top of them.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod extrema;
pub mod partition;
pub mod summary;
pub mod sweep;

pub use extrema::{
    classify, detect, AttractorKind, Attractors, Extrema, ExtremumKind, ExtremumRecord,
};
pub use partition::{partition, partition_at, Grouping, Partition};
pub use summary::{GroupStats, MeanStd};
pub use sweep::{Multiverse, Property, SweepPoint, Universe};

#[derive(Error, Debug)]
pub enum OpError {
    #[error("invalid array dimension {0}: group label array must have dimension 1 or 2")]
    InvalidRank(usize),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("unknown property: {0}")]
    UnknownProperty(String),
}

/// Tunables shared by the summary and sweep routines.
///
/// The turning-point thresholds are deliberately not part of this struct; they
/// are fixed constants in [`extrema`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisParams {
    /// Rolling window applied to the global mean before turning-point search.
    pub avg_window: usize,
    /// Rolling window used by the area summaries.
    pub area_window: usize,
    /// Histogram resolution for final-state summaries.
    pub bin_number: usize,
    pub val_range: (f64, f64),
    pub peak_prominence: f64,
    pub peak_distance: usize,
    pub peak_merge_fraction: f64,
    pub convergence_fraction: f64,
    pub convergence_bins: usize,
    /// Fraction of the series length a value must stay constant for.
    pub const_window: f64,
    pub const_tolerance: f64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            avg_window: 20,
            area_window: 10,
            bin_number: 100,
            val_range: (0.0, 1.0),
            peak_prominence: 15.0,
            peak_distance: 7,
            peak_merge_fraction: 0.15,
            convergence_fraction: 0.9,
            convergence_bins: 10,
            const_window: 0.3,
            const_tolerance: 0.01,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> Result<(), OpError> {
        if self.avg_window == 0 || self.area_window == 0 {
            return Err(OpError::InvalidParameter(
                "rolling windows must be at least 1".into(),
            ));
        }
        if self.bin_number == 0 || self.convergence_bins == 0 {
            return Err(OpError::InvalidParameter(
                "histogram bin counts must be at least 1".into(),
            ));
        }
        let (lo, hi) = self.val_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(OpError::InvalidParameter(format!(
                "value range ({lo}, {hi}) must be finite and increasing"
            )));
        }
        if !(0.0..=1.0).contains(&self.const_window) {
            return Err(OpError::InvalidParameter(
                "averaging window must be between 0 and 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.const_tolerance) {
            return Err(OpError::InvalidParameter(
                "tolerance must be between 0 and 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.convergence_fraction) {
            return Err(OpError::InvalidParameter(
                "convergence fraction must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    pub fn params_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Stable fingerprint of the parameter set, used to tag reports.
    pub fn params_hash_sha256(&self) -> Result<String, OpError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| OpError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
