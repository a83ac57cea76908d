//! Turning-point detection over a (possibly smoothed) scalar series.
//!
//! The slope is estimated with a centred three-point difference and the
//! curvature by applying the same stencil to the slope. Both estimates are
//! aligned so that index `i` refers to `values[i + 2]`. Leading `NaN`s, as
//! produced by a rolling-mean warm-up, are skipped.
//!
//! The two thresholds below decide ties and are part of the observable
//! behavior; they are intentionally not configurable.

use serde::{Deserialize, Serialize};

use crate::OpError;

/// Slopes below this magnitude count as flat.
pub const FLAT_SLOPE: f64 = 1e-5;
/// Candidates closer than this to the last recorded value are duplicates.
pub const DUPLICATE_TOLERANCE: f64 = 0.01;

/// Offset between a derivative index and the matching sample index.
const OFFSET: usize = 2;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExtremumKind {
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttractorKind {
    Const,
    Osc,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExtremumRecord<K> {
    pub kind: K,
    pub value: f64,
    /// Interpolated x-coordinate; present only when x values were supplied.
    pub position: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Extrema {
    pub min: Vec<ExtremumRecord<ExtremumKind>>,
    pub max: Vec<ExtremumRecord<ExtremumKind>>,
}

impl Extrema {
    pub fn is_empty(&self) -> bool {
        self.min.is_empty() && self.max.is_empty()
    }

    pub fn max_values(&self) -> Vec<f64> {
        self.max.iter().map(|r| r.value).collect()
    }

    fn is_duplicate(&self, value: f64) -> bool {
        near_last(&self.max, value) || near_last(&self.min, value)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Attractors {
    pub constant: Vec<ExtremumRecord<AttractorKind>>,
    pub oscillating: Vec<ExtremumRecord<AttractorKind>>,
}

impl Attractors {
    pub fn is_empty(&self) -> bool {
        self.constant.is_empty() && self.oscillating.is_empty()
    }

    fn is_duplicate(&self, value: f64) -> bool {
        near_last(&self.constant, value) || near_last(&self.oscillating, value)
    }
}

fn near_last<K>(bucket: &[ExtremumRecord<K>], value: f64) -> bool {
    bucket
        .last()
        .map_or(false, |r| (r.value - value).abs() < DUPLICATE_TOLERANCE)
}

/// Sign with numpy semantics: `NaN` stays `NaN` and therefore never compares
/// equal to another sign.
fn sign(v: f64) -> f64 {
    if v.is_nan() {
        f64::NAN
    } else if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Centred difference `0.5 * (diff[k + 1] + diff[k])` of the first
/// differences. The result is two samples shorter than the input.
fn centred_difference(values: &[f64]) -> Vec<f64> {
    let diff: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    diff.windows(2).map(|w| 0.5 * (w[1] + w[0])).collect()
}

struct Derivatives {
    d1: Vec<f64>,
    d2: Vec<f64>,
}

impl Derivatives {
    /// Returns `None` when the series is too short to yield a candidate.
    fn estimate(values: &[f64]) -> Option<Self> {
        if values.len() < 6 {
            return None;
        }
        let slope = centred_difference(values);
        let d2 = centred_difference(&slope);
        let d1 = slope[1..slope.len() - 1].to_vec();
        debug_assert_eq!(d1.len(), d2.len());
        Some(Self { d1, d2 })
    }

    /// Curvature must be non-zero and keep its sign across the event.
    fn has_consistent_curvature(&self, i: usize) -> bool {
        if self.d2[i] == 0.0 || i == 0 {
            return false;
        }
        sign(self.d2[i - 1]) == sign(self.d2[i + 1])
    }

    fn looks_constant(&self, i: usize) -> bool {
        self.d1[i].abs() < FLAT_SLOPE && self.d2[i].abs() < FLAT_SLOPE
    }
}

struct Candidate {
    index: usize,
    value: f64,
    position: Option<f64>,
}

fn scan(
    values: &[f64],
    x: Option<&[f64]>,
    derivs: &Derivatives,
) -> Vec<Candidate> {
    let d1 = &derivs.d1;
    let mut out = Vec::new();
    for i in 0..d1.len() - 1 {
        if d1[i].is_nan() {
            continue;
        }
        if !(d1[i].abs() < FLAT_SLOPE || sign(d1[i]) != sign(d1[i + 1])) {
            continue;
        }
        let (a, b) = (values[i + OFFSET], values[i + OFFSET + 1]);
        let value = if d1[i] > 0.0 { a.max(b) } else { a.min(b) };
        let position = x.map(|x| slope_root(x, d1, i));
        out.push(Candidate {
            index: i,
            value,
            position,
        });
    }
    out
}

/// Linear estimate of where the slope crosses zero between the two
/// straddling samples; falls back to their midpoint when the slopes match.
fn slope_root(x: &[f64], d1: &[f64], i: usize) -> f64 {
    let x_1 = x[i + OFFSET];
    let x_2 = x[i + OFFSET + 1];
    let y_1 = d1[i];
    let y_2 = d1[i + 1];
    if y_2 != y_1 {
        x_1 - y_1 * (x_2 - x_1) / (y_2 - y_1)
    } else {
        0.5 * (x_1 + x_2)
    }
}

fn check_x(values: &[f64], x: Option<&[f64]>) -> Result<(), OpError> {
    match x {
        Some(x) if x.len() < values.len() => Err(OpError::InvalidParameter(format!(
            "x has {} samples but the series has {}",
            x.len(),
            values.len()
        ))),
        _ => Ok(()),
    }
}

/// Finds the local minima and maxima of `values`.
///
/// A candidate is dropped if it lies within [`DUPLICATE_TOLERANCE`] of the
/// most recent record of either kind, or if the curvature vanishes or flips
/// sign around it. Accepted records go to `min` for positive curvature and to
/// `max` for negative curvature.
pub fn detect(values: &[f64], x: Option<&[f64]>) -> Result<Extrema, OpError> {
    check_x(values, x)?;
    let mut out = Extrema::default();
    let Some(derivs) = Derivatives::estimate(values) else {
        return Ok(out);
    };

    for cand in scan(values, x, &derivs) {
        if out.is_duplicate(cand.value) || !derivs.has_consistent_curvature(cand.index) {
            continue;
        }
        let curvature = derivs.d2[cand.index];
        let kind = if curvature > 0.0 {
            ExtremumKind::Min
        } else if curvature < 0.0 {
            ExtremumKind::Max
        } else {
            continue;
        };
        let record = ExtremumRecord {
            kind,
            value: cand.value,
            position: cand.position,
        };
        match kind {
            ExtremumKind::Min => out.min.push(record),
            ExtremumKind::Max => out.max.push(record),
        }
    }
    Ok(out)
}

/// Sorts turning points into plateaus (`Const`) and oscillation (`Osc`).
///
/// A candidate is `Const` when both slope and curvature are flat, unless the
/// previous record was already `Osc`. A `Const` record directly followed by an
/// `Osc` one was a transient plateau and is moved to the oscillating bucket.
pub fn classify(values: &[f64], x: Option<&[f64]>) -> Result<Attractors, OpError> {
    check_x(values, x)?;
    let mut out = Attractors::default();
    let Some(derivs) = Derivatives::estimate(values) else {
        return Ok(out);
    };

    let mut previous: Option<AttractorKind> = None;
    for cand in scan(values, x, &derivs) {
        if out.is_duplicate(cand.value) {
            continue;
        }
        let kind = if previous == Some(AttractorKind::Osc) || !derivs.looks_constant(cand.index)
        {
            AttractorKind::Osc
        } else {
            AttractorKind::Const
        };
        if kind == AttractorKind::Osc && previous == Some(AttractorKind::Const) {
            if let Some(mut plateau) = out.constant.pop() {
                plateau.kind = AttractorKind::Osc;
                out.oscillating.push(plateau);
            }
        }
        let record = ExtremumRecord {
            kind,
            value: cand.value,
            position: cand.position,
        };
        match kind {
            AttractorKind::Const => out.constant.push(record),
            AttractorKind::Osc => out.oscillating.push(record),
        }
        previous = Some(kind);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const PERIOD: f64 = 50.0;

    /// Sine with slowly growing amplitude so successive turning points differ
    /// by more than the duplicate tolerance.
    fn growing_sine(n: usize) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|t| t as f64).collect();
        let y = x
            .iter()
            .map(|&t| (1.0 + 0.001 * t) * (2.0 * PI * t / PERIOD).sin())
            .collect();
        (x, y)
    }

    #[test]
    fn test_growing_sine_turning_points() {
        let (x, y) = growing_sine(200);
        let res = detect(&y, Some(&x)).unwrap();

        assert_eq!(res.max.len(), 4);
        assert_eq!(res.min.len(), 4);
        assert!(res.max.len().abs_diff(res.min.len()) <= 1);

        for (k, rec) in res.max.iter().enumerate() {
            let expected = 12.5 + PERIOD * k as f64;
            let pos = rec.position.unwrap();
            assert!((pos - expected).abs() < 0.2, "max {k} at {pos}");
            assert!(rec.value > 0.99);
        }
        for (k, rec) in res.min.iter().enumerate() {
            let expected = 37.5 + PERIOD * k as f64;
            let pos = rec.position.unwrap();
            assert!((pos - expected).abs() < 0.2, "min {k} at {pos}");
            assert!(rec.value < -0.99);
        }

        let mut events: Vec<(f64, ExtremumKind)> = res
            .max
            .iter()
            .chain(res.min.iter())
            .map(|r| (r.position.unwrap(), r.kind))
            .collect();
        events.sort_by(|a, b| a.0.total_cmp(&b.0));
        for pair in events.windows(2) {
            assert_ne!(pair[0].1, pair[1].1);
        }
    }

    #[test]
    fn test_steady_sine_records_first_cycle_only() {
        let y: Vec<f64> = (0..200)
            .map(|t| (2.0 * PI * t as f64 / PERIOD).sin())
            .collect();
        let res = detect(&y, None).unwrap();
        assert_eq!(res.max.len(), 1);
        assert_eq!(res.min.len(), 1);
        assert!(res.max[0].position.is_none());
    }

    #[test]
    fn test_monotonic_is_empty() {
        let linear: Vec<f64> = (0..100).map(|t| 0.01 * t as f64).collect();
        assert!(detect(&linear, None).unwrap().is_empty());

        let quadratic: Vec<f64> = (0..100).map(|t| (t as f64).powi(2)).collect();
        assert!(detect(&quadratic, None).unwrap().is_empty());
    }

    #[test]
    fn test_constant_with_small_noise_at_most_one() {
        let y: Vec<f64> = (0..300)
            .map(|t| 0.5 + 1e-7 * (1.7 * t as f64).sin())
            .collect();
        let res = detect(&y, None).unwrap();
        assert!(res.min.len() + res.max.len() <= 1);
    }

    #[test]
    fn test_nan_prefix_is_skipped() {
        let (_, mut y) = growing_sine(200);
        for v in y.iter_mut().take(20) {
            *v = f64::NAN;
        }
        let res = detect(&y, None).unwrap();
        assert_eq!(res.max.len(), 3);
        assert_eq!(res.min.len(), 4);

        let all_nan = vec![f64::NAN; 50];
        assert!(detect(&all_nan, None).unwrap().is_empty());
    }

    #[test]
    fn test_short_series_is_empty() {
        assert!(detect(&[], None).unwrap().is_empty());
        assert!(detect(&[0.0, 1.0, 0.0, 1.0, 0.0], None).unwrap().is_empty());
    }

    #[test]
    fn test_short_x_rejected() {
        let (x, y) = growing_sine(60);
        assert!(matches!(
            detect(&y, Some(&x[..30])),
            Err(OpError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_detect_is_idempotent() {
        let (x, y) = growing_sine(200);
        let first = detect(&y, Some(&x)).unwrap();
        let second = detect(&y, Some(&x)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cross_kind_duplicate_is_suppressed() {
        // Peak at 0.8, trough at 0.2, then a second hump whose top (0.205)
        // sits within tolerance of the preceding trough.
        let mut y = Vec::new();
        for t in 0..40 {
            y.push(0.5 + 0.3 * (PI * t as f64 / 20.0).sin());
        }
        for t in 0..40 {
            y.push(0.2 + 0.005 * (1.0 - (PI * t as f64 / 20.0).cos()) / 2.0);
        }
        let res = detect(&y, None).unwrap();
        assert_eq!(res.max.len(), 1);
        assert!((res.max[0].value - 0.8).abs() < 0.01);
        assert_eq!(res.min.len(), 1);
        assert!((res.min[0].value - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_turning_point_at_first_derivative_sample_is_suppressed() {
        // Vertex between samples 2 and 3: the sign change sits at d1[0], where
        // no earlier curvature sample exists.
        let at_start: Vec<f64> = (0..10).map(|t| -(t as f64 - 2.5).powi(2)).collect();
        assert!(detect(&at_start, None).unwrap().is_empty());

        // One step later the same shape has both neighbours and is kept.
        let shifted: Vec<f64> = (0..10).map(|t| -(t as f64 - 3.5).powi(2)).collect();
        let res = detect(&shifted, None).unwrap();
        assert!(res.min.is_empty());
        assert_eq!(res.max.len(), 1);
        assert_eq!(res.max[0].value, -0.25);
    }

    #[test]
    fn test_slope_root_midpoint_fallback() {
        let x = [0.0, 1.0, 2.0, 4.0];
        let d1 = [0.3, 0.3];
        assert_eq!(slope_root(&x, &d1, 0), 3.0);

        let d1 = [1.0, -1.0];
        assert_eq!(slope_root(&x, &d1, 0), 3.0);
    }

    #[test]
    fn test_classify_plateau_is_constant() {
        // Relax towards 0.7 and stay there.
        let y: Vec<f64> = (0..400)
            .map(|t| 0.7 - 0.2 * (-(t as f64) / 15.0).exp())
            .collect();
        let res = classify(&y, None).unwrap();
        assert_eq!(res.constant.len(), 1);
        assert!(res.oscillating.is_empty());
        assert!((res.constant[0].value - 0.7).abs() < 1e-3);
    }

    #[test]
    fn test_classify_oscillation() {
        let (_, y) = growing_sine(200);
        let res = classify(&y, None).unwrap();
        assert!(res.constant.is_empty());
        assert_eq!(res.oscillating.len(), 8);
        assert!(res
            .oscillating
            .iter()
            .all(|r| r.kind == AttractorKind::Osc));
    }

    #[test]
    fn test_classify_reclassifies_transient_plateau() {
        // Flat at 0.3, then an oscillation around 0.6.
        let mut y = vec![0.3; 100];
        for t in 0..200 {
            y.push(0.6 + (0.2 + 0.001 * t as f64) * (2.0 * PI * t as f64 / PERIOD).sin());
        }
        let res = classify(&y, None).unwrap();
        assert!(res.constant.is_empty());
        assert!(!res.oscillating.is_empty());
        assert!((res.oscillating[0].value - 0.3).abs() < 1e-9);
        assert_eq!(res.oscillating[0].kind, AttractorKind::Osc);
    }
}
