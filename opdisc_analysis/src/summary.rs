//! Scalar and per-group summaries of opinion data.
//!
//! Everything here is built from the per-step agent means or from the final
//! opinion distribution. Empty groups and `NaN` samples are treated as "no
//! data" and never contribute a zero.

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

use crate::partition::{partition_at, Grouping, Partition};
use crate::{AnalysisParams, OpError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeanStd {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
}

/// Mean and population stddev of the non-`NaN` values.
pub fn mean_std(values: &[f64]) -> Option<MeanStd> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return None;
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(MeanStd {
        mean,
        std: var.sqrt(),
    })
}

/// Trailing rolling mean; the first `window - 1` entries and every window
/// containing a `NaN` yield `NaN`.
pub fn rolling_mean(series: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..series.len())
        .map(|i| {
            if i + 1 < window {
                return f64::NAN;
            }
            let slice = &series[i + 1 - window..=i];
            if slice.iter().any(|v| v.is_nan()) {
                f64::NAN
            } else {
                slice.iter().sum::<f64>() / window as f64
            }
        })
        .collect()
}

/// Mean opinion over agents at every time step.
pub fn agent_means(data: ArrayView2<f64>) -> Vec<f64> {
    data.outer_iter()
        .map(|row| mean_std(&finite(row)).map_or(f64::NAN, |m| m.mean))
        .collect()
}

fn smoothed_offsets(data: ArrayView2<f64>, window: usize) -> impl Iterator<Item = f64> {
    rolling_mean(&agent_means(data), window)
        .into_iter()
        .filter(|v| !v.is_nan())
        .map(|v| v - 0.5)
}

/// Magnitude of the signed area between the smoothed mean and 0.5.
pub fn area(data: ArrayView2<f64>, window: usize) -> f64 {
    smoothed_offsets(data, window).sum::<f64>().abs()
}

/// Unsigned area between the smoothed mean and 0.5.
pub fn absolute_area(data: ArrayView2<f64>, window: usize) -> f64 {
    smoothed_offsets(data, window).map(f64::abs).sum()
}

/// Equal-width histogram over `range`. The last bin is closed on the right;
/// values outside the range and `NaN`s are ignored.
///
/// Bin membership is decided against the edges `lo + k * step`, so a value
/// lying exactly on an edge lands in the bin that edge opens even when the
/// scaled index rounds below it.
pub fn histogram(values: &[f64], range: (f64, f64), bins: usize) -> Vec<usize> {
    let (lo, hi) = range;
    let mut counts = vec![0usize; bins];
    if bins == 0 || !(hi > lo) {
        return counts;
    }
    let norm = bins as f64 / (hi - lo);
    let step = (hi - lo) / bins as f64;
    let edge = |k: usize| if k == bins { hi } else { lo + k as f64 * step };
    for &v in values {
        if !(v >= lo && v <= hi) {
            continue;
        }
        let mut idx = (((v - lo) * norm) as usize).min(bins - 1);
        if idx > 0 && v < edge(idx) {
            idx -= 1;
        } else if idx + 1 < bins && v >= edge(idx + 1) {
            idx += 1;
        }
        counts[idx] += 1;
    }
    counts
}

fn finite(values: ArrayView1<f64>) -> Vec<f64> {
    values.iter().copied().filter(|v| !v.is_nan()).collect()
}

fn last_row<'a>(data: ArrayView2<'a, f64>) -> Result<ArrayView1<'a, f64>, OpError> {
    let steps = data.nrows();
    if steps == 0 {
        return Err(OpError::InsufficientData("no time steps".into()));
    }
    Ok(data.index_axis_move(Axis(0), steps - 1))
}

/// Local maxima of `x`; flat tops are reported at their middle sample.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let mut i = 1;
    let last = x.len() - 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Drops peaks closer than `distance` to a higher peak.
fn filter_by_distance(peaks: &[usize], x: &[f64], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];
    let mut by_height: Vec<usize> = (0..peaks.len()).collect();
    by_height.sort_by(|&a, &b| x[peaks[b]].total_cmp(&x[peaks[a]]).then(b.cmp(&a)));
    for &i in &by_height {
        if !keep[i] {
            continue;
        }
        for j in 0..peaks.len() {
            if j != i && keep[j] && peaks[i].abs_diff(peaks[j]) < distance {
                keep[j] = false;
            }
        }
    }
    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];
    let mut left_min = height;
    for &v in x[..peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }
    let mut right_min = height;
    for &v in &x[peak + 1..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }
    height - left_min.max(right_min)
}

/// Peaks of `x` at least `distance` samples apart with the given prominence.
pub fn find_peaks(x: &[f64], min_prominence: f64, distance: usize) -> Vec<usize> {
    let peaks = local_maxima(x);
    let peaks = if distance > 1 {
        filter_by_distance(&peaks, x, distance)
    } else {
        peaks
    };
    peaks
        .into_iter()
        .filter(|&p| prominence(x, p) >= min_prominence)
        .collect()
}

/// Number of opinion clusters in the final distribution.
pub fn number_of_peaks(data: ArrayView2<f64>, params: &AnalysisParams) -> Result<usize, OpError> {
    let values = finite(last_row(data)?);
    let hist: Vec<f64> = histogram(&values, params.val_range, params.bin_number)
        .into_iter()
        .map(|c| c as f64)
        .collect();
    Ok(find_peaks(&hist, params.peak_prominence, params.peak_distance).len())
}

/// Inverse participation ratio `Σp⁴ / (Σp²)²` of the final histogram.
pub fn localization(data: ArrayView2<f64>, params: &AnalysisParams) -> Result<Option<f64>, OpError> {
    let values = finite(last_row(data)?);
    if values.is_empty() {
        return Ok(None);
    }
    let n = values.len() as f64;
    let mut l = 0.0;
    let mut norm = 0.0;
    for c in histogram(&values, params.val_range, params.bin_number) {
        let p = c as f64 / n;
        norm += p.powi(4);
        l += p.powi(2);
    }
    if l == 0.0 {
        return Ok(None);
    }
    Ok(Some(norm / (l * l)))
}

pub fn max_distance(data: ArrayView2<f64>) -> Result<Option<f64>, OpError> {
    let values = finite(last_row(data)?);
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok((!values.is_empty()).then_some(hi - lo))
}

/// Sum of squared pairwise opinion differences in the final state.
pub fn polarization(data: ArrayView2<f64>) -> Result<f64, OpError> {
    let values = finite(last_row(data)?);
    let mut p = 0.0;
    for &a in &values {
        for &b in &values {
            p += (a - b).powi(2);
        }
    }
    Ok(p)
}

pub fn final_variance(data: ArrayView2<f64>) -> Result<Option<f64>, OpError> {
    let values = finite(last_row(data)?);
    Ok(mean_std(&values).map(|m| m.std * m.std))
}

/// First step at which a single histogram bin holds at least
/// `convergence_fraction` of all agents.
pub fn convergence_time(data: ArrayView2<f64>, params: &AnalysisParams) -> Option<usize> {
    let agents = data.ncols() as f64;
    for (t, row) in data.outer_iter().enumerate() {
        let hist = histogram(&finite(row), params.val_range, params.convergence_bins);
        let Some(&top) = hist.iter().max() else {
            continue;
        };
        if hist.iter().filter(|&&c| c == top).count() > 1 {
            continue;
        }
        if top as f64 >= params.convergence_fraction * agents {
            return Some(t);
        }
    }
    None
}

/// Dominant opinion bin of each group in the final state, as the left edge of
/// that bin. Tied bins are averaged when they lie close together; otherwise
/// the group has no well-defined peak.
pub fn peaks_by_group(
    data: ArrayView2<f64>,
    labels: ArrayViewD<f64>,
    num_groups: usize,
    params: &AnalysisParams,
) -> Result<Vec<Option<f64>>, OpError> {
    let last = last_row(data)?;
    let ids: Vec<f64> = (0..num_groups).map(|g| g as f64).collect();
    let single = last.insert_axis(Axis(0));
    let parts = partition_at(single, labels, &ids, Grouping::Static, 0)?;

    let (lo, hi) = params.val_range;
    let width = (hi - lo) / params.bin_number as f64;
    let max_spread = params.peak_merge_fraction * params.bin_number as f64;
    let mut peaks = Vec::with_capacity(num_groups);
    for k in 0..parts.num_groups() {
        let values = parts.at(k, 0);
        if values.is_empty() {
            peaks.push(None);
            continue;
        }
        let hist = histogram(values, params.val_range, params.bin_number);
        let top = hist.iter().copied().max().unwrap_or(0);
        let tied: Vec<usize> = (0..hist.len()).filter(|&i| hist[i] == top).collect();
        let bin = match tied.as_slice() {
            [only] => Some(*only as f64),
            [first, .., last] if ((last - first) as f64) < max_spread => {
                Some(tied.iter().sum::<usize>() as f64 / tied.len() as f64)
            }
            _ => None,
        };
        peaks.push(bin.map(|b| lo + b * width));
    }
    Ok(peaks)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConstVals {
    pub t: Vec<f64>,
    pub x: Vec<f64>,
}

/// Samples around which `series` stays within `const_tolerance` for at least
/// `const_window` of its length. Each qualifying window contributes its
/// centre sample.
pub fn find_const_vals(
    series: &[f64],
    time: Option<&[f64]>,
    params: &AnalysisParams,
) -> Result<ConstVals, OpError> {
    params.validate()?;
    if let Some(time) = time {
        if time.len() < series.len() {
            return Err(OpError::InvalidParameter(
                "time axis is shorter than the series".into(),
            ));
        }
    }
    let l = (params.const_window * series.len() as f64) as usize;
    let mut res = ConstVals::default();
    if l == 0 {
        return Ok(res);
    }
    let tol = params.const_tolerance;
    for i in l..series.len() {
        let reference = series[i - l];
        let is_const = (i - l + 1..=i).all(|p| (series[p] - reference).abs() <= tol);
        if is_const {
            let centre = (i as f64 - l as f64 / 2.0) as usize;
            if let Some(time) = time {
                res.t.push(time[centre]);
            }
            res.x.push(series[centre]);
        }
    }
    Ok(res)
}

/// Mean and stddev of every group at every step, `NaN` where a group is empty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupStats {
    /// Shape (time, group).
    pub means: Array2<f64>,
    pub stddevs: Array2<f64>,
}

pub fn group_stats(parts: &Partition) -> GroupStats {
    let shape = (parts.time_steps(), parts.num_groups());
    let mut means = Array2::from_elem(shape, f64::NAN);
    let mut stddevs = Array2::from_elem(shape, f64::NAN);
    for k in 0..parts.num_groups() {
        for t in 0..parts.time_steps() {
            if let Some(m) = mean_std(parts.at(k, t)) {
                means[[t, k]] = m.mean;
                stddevs[[t, k]] = m.std;
            }
        }
    }
    GroupStats { means, stddevs }
}

/// Distance of a group's mean opinion from the centre, and its spread.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupMoment {
    pub offset: f64,
    pub stddev: f64,
}

/// `|mean - 0.5|` and stddev of every group at one step; `None` for groups
/// without agents at that step.
pub fn group_moments_at(
    data: ArrayView2<f64>,
    labels: ArrayViewD<f64>,
    group_list: &[f64],
    grouping: Grouping,
    time_step: usize,
) -> Result<Vec<Option<GroupMoment>>, OpError> {
    let parts = partition_at(data, labels, group_list, grouping, time_step)?;
    Ok((0..parts.num_groups())
        .map(|k| {
            mean_std(parts.at(k, 0)).map(|m| GroupMoment {
                offset: (m.mean - 0.5).abs(),
                stddev: m.std,
            })
        })
        .collect())
}

/// Mean of group `g2` minus mean of group `g1` at step `t`.
pub fn extreme_means_difference(parts: &Partition, t: usize, g1: usize, g2: usize) -> Option<f64> {
    if g1 >= parts.num_groups() || g2 >= parts.num_groups() || t >= parts.time_steps() {
        return None;
    }
    let a = mean_std(parts.at(g1, t))?;
    let b = mean_std(parts.at(g2, t))?;
    Some(b.mean - a.mean)
}
