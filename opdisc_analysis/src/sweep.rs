//! Aggregation over a multiverse of runs.
//!
//! Universes are evaluated independently (in parallel) and then pooled by the
//! value of the swept coordinate; repeated seeds at one value are reduced to
//! a mean and stddev.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use ndarray::Array2;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extrema::{classify, detect};
use crate::partition::Grouping;
use crate::summary::{self, mean_std, MeanStd};
use crate::{AnalysisParams, OpError};

/// Coordinate that is never treated as a sweep dimension.
pub const SEED_KEY: &str = "seed";

/// One simulation run: its coordinates in parameter space and its data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Universe {
    pub coords: BTreeMap<String, f64>,
    /// Shape (time, agent).
    pub opinion: Array2<f64>,
    /// Shape (time, agent); constant rows unless labels are ages.
    #[serde(default)]
    pub group_label: Option<Array2<f64>>,
}

impl Universe {
    pub fn coord(&self, dim: &str) -> Result<f64, OpError> {
        self.coords.get(dim).copied().ok_or_else(|| {
            OpError::InvalidParameter(format!("universe has no coordinate '{}'", dim))
        })
    }

    /// Rolling-averaged mean opinion over time.
    pub fn smoothed_mean(&self, window: usize) -> Vec<f64> {
        summary::rolling_mean(&summary::agent_means(self.opinion.view()), window)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Multiverse {
    pub universes: Vec<Universe>,
}

impl Multiverse {
    pub fn new(universes: Vec<Universe>) -> Self {
        Self { universes }
    }

    /// Sorted distinct values taken by `dim`.
    pub fn values_of(&self, dim: &str) -> Vec<f64> {
        let set: BTreeSet<OrderedFloat<f64>> = self
            .universes
            .iter()
            .filter_map(|u| u.coords.get(dim).copied().map(OrderedFloat))
            .collect();
        set.into_iter().map(|v| v.0).collect()
    }

    /// The single coordinate, other than the seed and `ignore`, that takes
    /// more than one value.
    pub fn sweep_dimension(&self, ignore: &[&str]) -> Result<String, OpError> {
        let names: BTreeSet<&str> = self
            .universes
            .iter()
            .flat_map(|u| u.coords.keys().map(String::as_str))
            .collect();
        let swept: Vec<&str> = names
            .into_iter()
            .filter(|n| *n != SEED_KEY && !ignore.contains(n))
            .filter(|n| self.values_of(n).len() > 1)
            .collect();
        match swept.as_slice() {
            [dim] => {
                info!("Deduced sweep dimension '{}'", dim);
                Ok(dim.to_string())
            }
            [] => Err(OpError::InvalidParameter("no sweep parameter available".into())),
            many => Err(OpError::InvalidParameter(format!(
                "too many sweep dimensions {:?}; select a subspace first",
                many
            ))),
        }
    }

    /// Applies `f` to every universe and pools the results by the value of
    /// `dim`, in ascending order.
    fn evaluate<T, F>(
        &self,
        dim: &str,
        f: F,
    ) -> Result<BTreeMap<OrderedFloat<f64>, Vec<T>>, OpError>
    where
        T: Send,
        F: Fn(&Universe) -> Result<T, OpError> + Sync,
    {
        if self.universes.is_empty() {
            return Err(OpError::InsufficientData("multiverse is empty".into()));
        }
        let evaluated: Vec<(f64, T)> = self
            .universes
            .par_iter()
            .map(|u| -> Result<(f64, T), OpError> { Ok((u.coord(dim)?, f(u)?)) })
            .collect::<Result<_, _>>()?;
        let mut pooled: BTreeMap<OrderedFloat<f64>, Vec<T>> = BTreeMap::new();
        for (param, value) in evaluated {
            pooled.entry(OrderedFloat(param)).or_default().push(value);
        }
        Ok(pooled)
    }
}

/// Scalar summaries that can be swept.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    NumberOfPeaks,
    Localization,
    MaxDistance,
    Polarization,
    FinalVariance,
    ConvergenceTime,
    Area,
    AbsoluteArea,
}

impl Property {
    pub const ALL: [Property; 8] = [
        Property::NumberOfPeaks,
        Property::Localization,
        Property::MaxDistance,
        Property::Polarization,
        Property::FinalVariance,
        Property::ConvergenceTime,
        Property::Area,
        Property::AbsoluteArea,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Property::NumberOfPeaks => "number_of_peaks",
            Property::Localization => "localization",
            Property::MaxDistance => "max_distance",
            Property::Polarization => "polarization",
            Property::FinalVariance => "final_variance",
            Property::ConvergenceTime => "convergence_time",
            Property::Area => "area",
            Property::AbsoluteArea => "absolute_area",
        }
    }

    /// Value for one universe; `None` when the summary is undefined, e.g. a
    /// run that never converges.
    pub fn evaluate(&self, u: &Universe, params: &AnalysisParams) -> Result<Option<f64>, OpError> {
        let data = u.opinion.view();
        Ok(match self {
            Property::NumberOfPeaks => Some(summary::number_of_peaks(data, params)? as f64),
            Property::Localization => summary::localization(data, params)?,
            Property::MaxDistance => summary::max_distance(data)?,
            Property::Polarization => Some(summary::polarization(data)?),
            Property::FinalVariance => summary::final_variance(data)?,
            Property::ConvergenceTime => summary::convergence_time(data, params).map(|t| t as f64),
            Property::Area => Some(summary::area(data, params.area_window)),
            Property::AbsoluteArea => Some(summary::absolute_area(data, params.area_window)),
        })
    }
}

impl FromStr for Property {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        Property::ALL
            .into_iter()
            .find(|p| p.id() == normalized)
            .ok_or_else(|| OpError::UnknownProperty(normalized.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SweepPoint {
    pub param: f64,
    /// Mean and stddev across seeds; `None` if no seed produced a value.
    pub stats: Option<MeanStd>,
    pub samples: usize,
    /// Seeds for which the property was undefined.
    pub missing: usize,
}

pub fn sweep_property(
    mv: &Multiverse,
    dim: &str,
    property: Property,
    params: &AnalysisParams,
) -> Result<Vec<SweepPoint>, OpError> {
    params.validate()?;
    info!(property = property.id(), dim, universes = mv.universes.len(), "sweeping");
    let pooled = mv.evaluate(dim, |u| property.evaluate(u, params))?;
    Ok(pooled
        .into_iter()
        .map(|(param, values)| {
            let defined: Vec<f64> = values.iter().flatten().copied().collect();
            SweepPoint {
                param: param.0,
                stats: mean_std(&defined),
                samples: defined.len(),
                missing: values.len() - defined.len(),
            }
        })
        .collect())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BifurcationPoint {
    pub param: f64,
    /// Upper turning points of the smoothed mean, pooled over seeds.
    pub maxima: Vec<f64>,
}

pub fn bifurcation(
    mv: &Multiverse,
    dim: &str,
    params: &AnalysisParams,
) -> Result<Vec<BifurcationPoint>, OpError> {
    params.validate()?;
    let pooled = mv.evaluate(dim, |u| {
        Ok(detect(&u.smoothed_mean(params.avg_window), None)?.max_values())
    })?;
    Ok(pooled
        .into_iter()
        .map(|(param, runs)| BifurcationPoint {
            param: param.0,
            maxima: runs.into_iter().flatten().collect(),
        })
        .collect())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttractorPoint {
    pub param: f64,
    pub constant: Vec<f64>,
    pub oscillating: Vec<f64>,
}

/// Plateau and oscillation values of the smoothed mean per parameter value.
pub fn attractors(
    mv: &Multiverse,
    dim: &str,
    params: &AnalysisParams,
) -> Result<Vec<AttractorPoint>, OpError> {
    params.validate()?;
    let pooled = mv.evaluate(dim, |u| classify(&u.smoothed_mean(params.avg_window), None))?;
    Ok(pooled
        .into_iter()
        .map(|(param, runs)| {
            let mut point = AttractorPoint {
                param: param.0,
                constant: Vec::new(),
                oscillating: Vec::new(),
            };
            for run in runs {
                point.constant.extend(run.constant.iter().map(|r| r.value));
                point.oscillating.extend(run.oscillating.iter().map(|r| r.value));
            }
            point
        })
        .collect())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupSweepPoint {
    pub param: f64,
    /// Per group: seed statistics of `|mean - 0.5|` at the last step.
    pub offsets: Vec<Option<MeanStd>>,
    /// Per group: seed statistics of the within-group stddev at the last step.
    pub stddevs: Vec<Option<MeanStd>>,
}

/// Per-group opinion offsets and spreads at the final step, pooled over seeds.
/// Universes without group labels are skipped.
pub fn group_sweep(
    mv: &Multiverse,
    dim: &str,
    group_list: &[f64],
    grouping: Grouping,
) -> Result<Vec<GroupSweepPoint>, OpError> {
    let num_groups = grouping.num_groups(group_list);
    let pooled = mv.evaluate(dim, |u| {
        let Some(labels) = u.group_label.as_ref() else {
            warn!(coords = ?u.coords, "universe has no group labels; skipping");
            return Ok(None);
        };
        let last = u.opinion.nrows().checked_sub(1).ok_or_else(|| {
            OpError::InsufficientData("universe has no time steps".into())
        })?;
        let moments = summary::group_moments_at(
            u.opinion.view(),
            labels.view().into_dyn(),
            group_list,
            grouping,
            last,
        )?;
        Ok(Some(moments))
    })?;

    Ok(pooled
        .into_iter()
        .map(|(param, runs)| {
            let runs: Vec<_> = runs.into_iter().flatten().collect();
            let per_group = |pick: fn(&summary::GroupMoment) -> f64| -> Vec<Option<MeanStd>> {
                (0..num_groups)
                    .map(|k| {
                        let values: Vec<f64> = runs
                            .iter()
                            .filter_map(|m| m.get(k).copied().flatten())
                            .map(|m| pick(&m))
                            .collect();
                        mean_std(&values)
                    })
                    .collect()
            };
            GroupSweepPoint {
                param: param.0,
                offsets: per_group(|m| m.offset),
                stddevs: per_group(|m| m.stddev),
            }
        })
        .collect())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupPeakPoint {
    pub param: f64,
    /// Per group: seed statistics of the dominant final opinion bin.
    pub peaks: Vec<Option<MeanStd>>,
    /// Per group: seeds without a well-defined peak.
    pub missing: Vec<usize>,
}

/// Number of groups implied by integer group ids `0..=max`.
fn groups_from_labels(labels: &Array2<f64>) -> Result<usize, OpError> {
    let first = labels.outer_iter().next().ok_or_else(|| {
        OpError::ShapeMismatch("group label array has no time steps".into())
    })?;
    let max = first.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max.is_finite() && max >= 0.0) {
        return Err(OpError::InvalidParameter(format!(
            "group ids must be non-negative, largest is {}",
            max
        )));
    }
    Ok(max as usize + 1)
}

/// Dominant opinion of every group in the final state, pooled over seeds.
/// Group ids are read from the first row of each universe's labels.
pub fn group_peaks(
    mv: &Multiverse,
    dim: &str,
    params: &AnalysisParams,
) -> Result<Vec<GroupPeakPoint>, OpError> {
    params.validate()?;
    let pooled = mv.evaluate(dim, |u| {
        let Some(labels) = u.group_label.as_ref() else {
            warn!(coords = ?u.coords, "universe has no group labels; skipping");
            return Ok(None);
        };
        let num_groups = groups_from_labels(labels)?;
        let first = labels.row(0).into_dyn();
        summary::peaks_by_group(u.opinion.view(), first, num_groups, params).map(Some)
    })?;

    Ok(pooled
        .into_iter()
        .map(|(param, runs)| {
            let runs: Vec<Vec<Option<f64>>> = runs.into_iter().flatten().collect();
            let num_groups = runs.iter().map(Vec::len).max().unwrap_or(0);
            let mut point = GroupPeakPoint {
                param: param.0,
                peaks: Vec::with_capacity(num_groups),
                missing: Vec::with_capacity(num_groups),
            };
            for k in 0..num_groups {
                let values: Vec<f64> = runs
                    .iter()
                    .filter_map(|r| r.get(k).copied().flatten())
                    .collect();
                point.missing.push(runs.len() - values.len());
                point.peaks.push(mean_std(&values));
            }
            point
        })
        .collect())
}
