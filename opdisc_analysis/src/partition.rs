//! Splits a (time × agent) array into per-group sub-series.
//!
//! Static labels are group ids that never change: agents are sorted once and
//! every time row is sliced at the same boundaries. Dynamic labels (ages) are
//! binned per time step into half-open intervals `[edge_k, edge_k+1)`.

use ndarray::{ArrayView1, ArrayView2, ArrayViewD, Axis, Ix1, Ix2, Slice};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::OpError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Grouping {
    /// `group_list` enumerates group ids; labels are constant over time.
    #[default]
    Static,
    /// `group_list` holds bin edges; labels may change at every step.
    Dynamic,
}

impl Grouping {
    pub fn num_groups(&self, group_list: &[f64]) -> usize {
        match self {
            Grouping::Static => group_list.len(),
            Grouping::Dynamic => group_list.len().saturating_sub(1),
        }
    }
}

/// Per-group, per-step agent values. Empty vectors mean "no data".
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    /// `groups[k][t]` holds the values of group `k` at step `t`.
    pub groups: Vec<Vec<Vec<f64>>>,
    /// Observations whose label fell outside every reported group.
    pub dropped: usize,
}

impl Partition {
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn time_steps(&self) -> usize {
        self.groups.first().map_or(0, Vec::len)
    }

    pub fn at(&self, group: usize, t: usize) -> &[f64] {
        &self.groups[group][t]
    }

    /// Number of agents per group at step `t`.
    pub fn sizes_at(&self, t: usize) -> Vec<usize> {
        self.groups.iter().map(|g| g[t].len()).collect()
    }

    fn empty(num_groups: usize, time_steps: usize) -> Self {
        Self {
            groups: vec![vec![Vec::new(); time_steps]; num_groups],
            dropped: 0,
        }
    }
}

/// Partitions every time step of `data` by `groups`.
///
/// `groups` may be 1-D (one label per agent) or 2-D (time × agent). For
/// [`Grouping::Static`] only the first row of 2-D labels is used. For
/// [`Grouping::Dynamic`] 2-D labels need a single row or at least as many rows
/// as `data`; extra trailing rows are ignored. The caller's `group_list` is
/// never modified.
pub fn partition(
    data: ArrayView2<f64>,
    groups: ArrayViewD<f64>,
    group_list: &[f64],
    grouping: Grouping,
) -> Result<Partition, OpError> {
    let labels = labels_2d(groups, data.ncols())?;
    if labels.iter().any(|l| l.is_nan()) {
        return Err(OpError::InvalidParameter(
            "group labels contain NaN".into(),
        ));
    }
    match grouping {
        Grouping::Static => {
            if group_list.is_empty() {
                return Err(OpError::InvalidParameter("group list is empty".into()));
            }
            Ok(partition_static(data, labels.row(0), group_list))
        }
        Grouping::Dynamic => {
            check_edges(group_list)?;
            // Label rows past the last data step are never read.
            let labels = if labels.nrows() > data.nrows() {
                let mut labels = labels;
                labels.slice_axis_inplace(Axis(0), Slice::from(0..data.nrows()));
                labels
            } else {
                labels
            };
            let labels = labels.broadcast(data.raw_dim()).ok_or_else(|| {
                OpError::ShapeMismatch(format!(
                    "labels of shape {:?} do not cover data of shape {:?}",
                    labels.shape(),
                    data.shape()
                ))
            })?;
            Ok(partition_dynamic(data, labels, group_list))
        }
    }
}

/// Partitions a single time step. With 2-D labels the labels of that same
/// step are used.
pub fn partition_at(
    data: ArrayView2<f64>,
    groups: ArrayViewD<f64>,
    group_list: &[f64],
    grouping: Grouping,
    time_step: usize,
) -> Result<Partition, OpError> {
    if time_step >= data.nrows() {
        return Err(OpError::InvalidParameter(format!(
            "time step {} out of range for {} steps",
            time_step,
            data.nrows()
        )));
    }
    let row = data.slice_axis(Axis(0), Slice::from(time_step..time_step + 1));
    let groups = if groups.ndim() == 2 && grouping == Grouping::Dynamic {
        if time_step >= groups.shape()[0] {
            return Err(OpError::ShapeMismatch(format!(
                "labels have {} steps, requested step {}",
                groups.shape()[0],
                time_step
            )));
        }
        groups.index_axis_move(Axis(0), time_step)
    } else {
        groups
    };
    partition(row, groups, group_list, grouping)
}

fn labels_2d(groups: ArrayViewD<f64>, agents: usize) -> Result<ArrayView2<f64>, OpError> {
    let labels = match groups.ndim() {
        1 => groups
            .into_dimensionality::<Ix1>()
            .map_err(|e| OpError::ShapeMismatch(e.to_string()))?
            .insert_axis(Axis(0)),
        2 => groups
            .into_dimensionality::<Ix2>()
            .map_err(|e| OpError::ShapeMismatch(e.to_string()))?,
        n => return Err(OpError::InvalidRank(n)),
    };
    if labels.nrows() == 0 {
        return Err(OpError::ShapeMismatch("label array has no time steps".into()));
    }
    if labels.ncols() != agents {
        return Err(OpError::ShapeMismatch(format!(
            "{} labels for {} agents",
            labels.ncols(),
            agents
        )));
    }
    Ok(labels)
}

fn check_edges(edges: &[f64]) -> Result<(), OpError> {
    if edges.len() < 2 {
        return Err(OpError::InvalidParameter(
            "bin edges need at least two entries".into(),
        ));
    }
    if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(OpError::InvalidParameter(
            "bin edges must be finite and strictly increasing".into(),
        ));
    }
    Ok(())
}

fn partition_static(data: ArrayView2<f64>, labels: ArrayView1<f64>, ids: &[f64]) -> Partition {
    let mut out = Partition::empty(ids.len(), data.nrows());
    if labels.is_empty() {
        return out;
    }

    let mut order: Vec<usize> = (0..labels.len()).collect();
    order.sort_by(|&a, &b| labels[a].total_cmp(&labels[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| labels[i]).collect();

    let mut bounds = vec![0];
    for i in 0..sorted.len() - 1 {
        if sorted[i + 1] > sorted[i] {
            bounds.push(i + 1);
        }
    }
    bounds.push(sorted.len());

    let targets: Vec<Option<usize>> = bounds
        .windows(2)
        .map(|w| ids.iter().position(|&id| id == sorted[w[0]]))
        .collect();
    for (w, target) in bounds.windows(2).zip(&targets) {
        if target.is_none() {
            debug!(label = sorted[w[0]], agents = w[1] - w[0], "label not in group list");
        }
    }

    let mut permuted = Vec::with_capacity(order.len());
    for (t, row) in data.outer_iter().enumerate() {
        permuted.clear();
        permuted.extend(order.iter().map(|&i| row[i]));
        for (w, target) in bounds.windows(2).zip(&targets) {
            match target {
                Some(k) => out.groups[*k][t].extend_from_slice(&permuted[w[0]..w[1]]),
                None => out.dropped += w[1] - w[0],
            }
        }
    }
    out
}

fn partition_dynamic(data: ArrayView2<f64>, labels: ArrayView2<f64>, edges: &[f64]) -> Partition {
    let mut edges = edges.to_vec();
    let last_edge = edges[edges.len() - 1];
    let max_label = labels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let extended = max_label >= last_edge;
    if extended {
        debug!(max_label, last_edge, "extending bin edges to cover all labels");
        edges.push(max_label + 1.0);
    }

    let mut out = Partition::empty(edges.len() - 1, data.nrows());
    for (t, (row, label_row)) in data.outer_iter().zip(labels.outer_iter()).enumerate() {
        for (&value, &label) in row.iter().zip(label_row.iter()) {
            match bin_index(&edges, label) {
                Some(k) => out.groups[k][t].push(value),
                None => out.dropped += 1,
            }
        }
    }

    if extended {
        if let Some(overflow) = out.groups.pop() {
            let lost: usize = overflow.iter().map(Vec::len).sum();
            if lost > 0 {
                debug!(lost, "discarding observations beyond the last bin edge");
            }
            out.dropped += lost;
        }
    }
    out
}

/// Index of the half-open bin `[edges[k], edges[k + 1])` containing `label`.
fn bin_index(edges: &[f64], label: f64) -> Option<usize> {
    let last = edges[edges.len() - 1];
    if label < edges[0] || label >= last {
        return None;
    }
    Some(edges.partition_point(|&e| e <= label) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array2, Array3};

    fn sorted(values: &[f64]) -> Vec<f64> {
        let mut v = values.to_vec();
        v.sort_by(f64::total_cmp);
        v
    }

    #[test]
    fn test_single_group_takes_everything() {
        let data = arr2(&[[0.2, 0.7, 0.9]]);
        let labels = arr1(&[0.0, 0.0, 0.0]);
        let res = partition(data.view(), labels.view().into_dyn(), &[0.0, 1.0], Grouping::Static)
            .unwrap();
        assert_eq!(res.num_groups(), 2);
        assert_eq!(sorted(res.at(0, 0)), vec![0.2, 0.7, 0.9]);
        assert!(res.at(1, 0).is_empty());
        assert_eq!(res.dropped, 0);
    }

    #[test]
    fn test_static_labels_reordered_then_sliced() {
        let data = arr2(&[[0.2, 0.7, 0.9]]);
        let labels = arr1(&[0.0, 1.0, 0.0]);
        let res = partition(
            data.view(),
            labels.view().into_dyn(),
            &[0.0, 1.0, 2.0],
            Grouping::Static,
        )
        .unwrap();
        assert_eq!(res.num_groups(), 3);
        assert_eq!(sorted(res.at(0, 0)), vec![0.2, 0.9]);
        assert_eq!(res.at(1, 0), &[0.7]);
        assert!(res.at(2, 0).is_empty());
    }

    #[test]
    fn test_static_union_equals_row() {
        let labels = arr1(&[2.0, 0.0, 1.0, 1.0, 0.0, 2.0, 2.0]);
        let data = Array2::from_shape_fn((5, 7), |(t, a)| (t * 7 + a) as f64 / 35.0);
        let res = partition(
            data.view(),
            labels.view().into_dyn(),
            &[0.0, 1.0, 2.0],
            Grouping::Static,
        )
        .unwrap();
        assert_eq!(res.num_groups(), 3);
        assert_eq!(res.time_steps(), 5);
        for t in 0..5 {
            let mut union: Vec<f64> = (0..3).flat_map(|k| res.at(k, t).to_vec()).collect();
            union.sort_by(f64::total_cmp);
            assert_eq!(union, sorted(data.row(t).as_slice().unwrap()));
            assert_eq!(res.sizes_at(t), vec![2, 2, 3]);
        }
    }

    #[test]
    fn test_static_skipped_id_lands_in_matching_group() {
        let data = arr2(&[[0.1, 0.2, 0.3]]);
        let labels = arr1(&[2.0, 0.0, 2.0]);
        let res = partition(
            data.view(),
            labels.view().into_dyn(),
            &[0.0, 1.0, 2.0],
            Grouping::Static,
        )
        .unwrap();
        assert_eq!(res.at(0, 0), &[0.2]);
        assert!(res.at(1, 0).is_empty());
        assert_eq!(sorted(res.at(2, 0)), vec![0.1, 0.3]);
    }

    #[test]
    fn test_static_unknown_label_is_counted() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4]]);
        let labels = arr1(&[0.0, 5.0]);
        let res =
            partition(data.view(), labels.view().into_dyn(), &[0.0], Grouping::Static).unwrap();
        assert_eq!(res.at(0, 0), &[0.1]);
        assert_eq!(res.at(0, 1), &[0.3]);
        assert_eq!(res.dropped, 2);
    }

    #[test]
    fn test_static_uses_first_row_of_2d_labels() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4]]);
        let labels = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let res = partition(
            data.view(),
            labels.view().into_dyn(),
            &[0.0, 1.0],
            Grouping::Static,
        )
        .unwrap();
        assert_eq!(res.at(0, 0), &[0.2]);
        assert_eq!(res.at(0, 1), &[0.4]);
        assert_eq!(res.at(1, 1), &[0.3]);
    }

    #[test]
    fn test_dynamic_ages_follow_bins() {
        let data = arr2(&[[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]);
        let ages = arr2(&[[0.0, 9.0, 10.0], [1.0, 10.0, 19.5]]);
        let edges = [0.0, 10.0, 20.0];
        let res = partition(data.view(), ages.view().into_dyn(), &edges, Grouping::Dynamic)
            .unwrap();
        assert_eq!(res.num_groups(), 2);
        assert_eq!(res.at(0, 0), &[0.1, 0.2]);
        assert_eq!(res.at(1, 0), &[0.3]);
        assert_eq!(res.at(0, 1), &[0.4]);
        assert_eq!(res.at(1, 1), &[0.5, 0.6]);
        assert_eq!(res.dropped, 0);

        // Each agent appears in exactly the bin containing its age.
        for t in 0..2 {
            for a in 0..3 {
                let age = ages[[t, a]];
                let value = data[[t, a]];
                for k in 0..2 {
                    let inside = edges[k] <= age && age < edges[k + 1];
                    assert_eq!(res.at(k, t).contains(&value), inside);
                }
            }
        }
    }

    #[test]
    fn test_dynamic_extension_drops_overflow() {
        let data = arr2(&[[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]);
        let ages = arr2(&[[5.0, 15.0, 19.0], [6.0, 16.0, 25.0]]);
        let edges = vec![0.0, 10.0, 20.0];
        let res = partition(data.view(), ages.view().into_dyn(), &edges, Grouping::Dynamic)
            .unwrap();
        assert_eq!(res.num_groups(), 2);
        assert_eq!(res.at(1, 0), &[0.2, 0.3]);
        assert_eq!(res.at(1, 1), &[0.5]);
        assert!(!res.groups.iter().any(|g| g[1].contains(&0.6)));
        assert_eq!(res.dropped, 1);
        assert_eq!(edges, vec![0.0, 10.0, 20.0]);

        let again = partition(data.view(), ages.view().into_dyn(), &edges, Grouping::Dynamic)
            .unwrap();
        assert_eq!(res, again);
    }

    #[test]
    fn test_dynamic_broadcasts_1d_labels() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]]);
        let ages = arr1(&[1.5, 0.5]);
        let res = partition(
            data.view(),
            ages.view().into_dyn(),
            &[0.0, 1.0, 2.0],
            Grouping::Dynamic,
        )
        .unwrap();
        assert_eq!(res.time_steps(), 3);
        assert_eq!(res.at(0, 2), &[0.6]);
        assert_eq!(res.at(1, 2), &[0.5]);
    }

    #[test]
    fn test_empty_bin_at_some_step() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4]]);
        let ages = arr2(&[[1.0, 1.0], [1.0, 11.0]]);
        let res = partition(
            data.view(),
            ages.view().into_dyn(),
            &[0.0, 10.0, 20.0],
            Grouping::Dynamic,
        )
        .unwrap();
        assert!(res.at(1, 0).is_empty());
        assert_eq!(res.at(1, 1), &[0.4]);
    }

    #[test]
    fn test_rank_three_rejected() {
        let data = arr2(&[[0.1, 0.2]]);
        let labels = Array3::<f64>::zeros((1, 1, 2));
        let err = partition(data.view(), labels.view().into_dyn(), &[0.0], Grouping::Static)
            .unwrap_err();
        assert!(matches!(err, OpError::InvalidRank(3)));
    }

    #[test]
    fn test_label_count_mismatch_rejected() {
        let data = arr2(&[[0.1, 0.2, 0.3]]);
        let labels = arr1(&[0.0, 1.0]);
        let err = partition(data.view(), labels.view().into_dyn(), &[0.0, 1.0], Grouping::Static)
            .unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch(_)));
    }

    #[test]
    fn test_unsorted_edges_rejected() {
        let data = arr2(&[[0.1]]);
        let labels = arr1(&[0.0]);
        let err = partition(
            data.view(),
            labels.view().into_dyn(),
            &[0.0, 20.0, 10.0],
            Grouping::Dynamic,
        )
        .unwrap_err();
        assert!(matches!(err, OpError::InvalidParameter(_)));
    }

    #[test]
    fn test_partition_at_selects_step_labels() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4]]);
        let ages = arr2(&[[1.0, 11.0], [11.0, 1.0]]);
        let res = partition_at(
            data.view(),
            ages.view().into_dyn(),
            &[0.0, 10.0, 20.0],
            Grouping::Dynamic,
            1,
        )
        .unwrap();
        assert_eq!(res.time_steps(), 1);
        assert_eq!(res.at(0, 0), &[0.4]);
        assert_eq!(res.at(1, 0), &[0.3]);

        assert!(partition_at(
            data.view(),
            ages.view().into_dyn(),
            &[0.0, 10.0],
            Grouping::Dynamic,
            2
        )
        .is_err());
    }

    #[test]
    fn test_extra_label_rows_are_ignored() {
        let data = arr2(&[[0.1, 0.2], [0.3, 0.4]]);
        let ages = arr2(&[[1.0, 11.0], [11.0, 1.0], [50.0, 50.0]]);
        let edges = [0.0, 10.0, 20.0];
        let res = partition(
            data.view(),
            ages.view().into_dyn(),
            &edges,
            Grouping::Dynamic,
        )
        .unwrap();
        assert_eq!(res.time_steps(), 2);
        assert_eq!(res.dropped, 0);
        assert_eq!(res.at(0, 0), &[0.1]);
        assert_eq!(res.at(0, 1), &[0.4]);
        assert_eq!(res.at(1, 1), &[0.3]);

        let short = arr2(&[[1.0, 11.0], [11.0, 1.0]]);
        let longer = arr2(&[[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]]);
        assert!(matches!(
            partition(longer.view(), short.view().into_dyn(), &edges, Grouping::Dynamic),
            Err(OpError::ShapeMismatch(_))
        ));
    }
}
