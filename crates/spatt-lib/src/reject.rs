//! Peak-to-peak rejection thresholds estimated by cross-validation.
//!
//! For every channel kind a single global threshold is chosen from a grid of
//! candidates. Each candidate is scored by k-fold cross-validation: the mean
//! of the training epochs that survive the threshold is compared with the
//! median of the held-out epochs, and the candidate with the lowest RMSE wins.
use crate::epochs::{Epochs, RejectThresholds};
use crate::error::{AnalysisError, AnalysisResult};
use crate::signal::ChannelKind;
use log::{debug, info};
use ndarray::{Array2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdParams {
    pub n_folds: usize,
    pub n_candidates: usize,
    pub seed: u64,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            n_folds: 10,
            n_candidates: 40,
            seed: 42,
        }
    }
}

fn good_channels(epochs: &Epochs, kind: ChannelKind) -> Vec<usize> {
    epochs
        .ch_kinds
        .iter()
        .enumerate()
        .filter(|(i, k)| **k == kind && !epochs.bads.contains(&epochs.ch_names[*i]))
        .map(|(i, _)| i)
        .collect()
}

fn candidate_grid(values: &[f64], n: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    if sorted.len() <= n || n < 2 {
        return sorted;
    }
    (0..n)
        .map(|i| sorted[i * (sorted.len() - 1) / (n - 1)])
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Channel × time matrix of one epoch restricted to `channels`.
fn epoch_matrix(epochs: &Epochs, epoch: usize, channels: &[usize]) -> Array2<f64> {
    epochs
        .data
        .index_axis(Axis(0), epoch)
        .select(Axis(0), channels)
}

fn fold_error(epochs: &Epochs, channels: &[usize], train: &[usize], test: &[usize]) -> f64 {
    if train.is_empty() || test.is_empty() {
        return f64::INFINITY;
    }
    let n_times = epochs.n_times();
    let mut mean = Array2::<f64>::zeros((channels.len(), n_times));
    for &e in train {
        mean += &epoch_matrix(epochs, e, channels);
    }
    mean /= train.len() as f64;

    let mut sq = 0.0;
    let mut column = vec![0.0; test.len()];
    for (ci, &c) in channels.iter().enumerate() {
        for t in 0..n_times {
            for (slot, &e) in column.iter_mut().zip(test) {
                *slot = epochs.data[[e, c, t]];
            }
            let diff = mean[[ci, t]] - median(&mut column);
            sq += diff * diff;
        }
    }
    (sq / (channels.len() * n_times) as f64).sqrt()
}

/// Global threshold for the good channels of `kind`, or `None` when the
/// epochs carry no such channel.
pub fn global_threshold(epochs: &Epochs, kind: ChannelKind, params: &ThresholdParams) -> AnalysisResult<Option<f64>> {
    let channels = good_channels(epochs, kind);
    if channels.is_empty() {
        return Ok(None);
    }
    let n_epochs = epochs.len();
    if n_epochs < 2 {
        return Err(AnalysisError::EmptySelection(format!(
            "need at least two epochs to estimate a threshold, got {}",
            n_epochs
        )));
    }
    let ptp = epochs.ptp();
    let epoch_max: Vec<f64> = (0..n_epochs)
        .map(|e| channels.iter().map(|&c| ptp[[e, c]]).fold(0.0, f64::max))
        .collect();
    let candidates = candidate_grid(&epoch_max, params.n_candidates);

    let mut order: Vec<usize> = (0..n_epochs).collect();
    let mut rng = StdRng::seed_from_u64(params.seed);
    order.shuffle(&mut rng);
    let n_folds = params.n_folds.clamp(2, n_epochs);
    let folds: Vec<Vec<usize>> = (0..n_folds)
        .map(|f| order.iter().skip(f).step_by(n_folds).copied().collect())
        .collect();

    let mut best = (f64::INFINITY, candidates[candidates.len() - 1]);
    for &threshold in &candidates {
        let mut total = 0.0;
        for (f, test) in folds.iter().enumerate() {
            let train: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(g, _)| *g != f)
                .flat_map(|(_, fold)| fold.iter().copied())
                .filter(|&e| epoch_max[e] <= threshold)
                .collect();
            total += fold_error(epochs, &channels, &train, test);
        }
        let score = total / n_folds as f64;
        debug!("{:?} threshold {:.3e}: cv rmse {:.3e}", kind, threshold, score);
        if score < best.0 {
            best = (score, threshold);
        }
    }
    info!("{:?} rejection threshold {:.3e} (cv rmse {:.3e})", kind, best.1, best.0);
    Ok(Some(best.1))
}

/// Thresholds for every EEG, EOG and LFP kind present among the good channels.
pub fn estimate_thresholds(epochs: &Epochs, params: &ThresholdParams) -> AnalysisResult<RejectThresholds> {
    let mut out = RejectThresholds::new();
    for kind in [ChannelKind::Eeg, ChannelKind::Eog, ChannelKind::Lfp] {
        if let Some(threshold) = global_threshold(epochs, kind, params)? {
            out.insert(kind, threshold);
        }
    }
    Ok(out)
}

/// Number of epochs in which each good channel exceeds its kind's threshold.
pub fn bad_channel_counts(epochs: &Epochs, thresholds: &RejectThresholds) -> BTreeMap<String, usize> {
    let ptp = epochs.ptp();
    let mut counts = BTreeMap::new();
    for (kind, limit) in thresholds {
        for c in good_channels(epochs, *kind) {
            let n = (0..epochs.len()).filter(|&e| ptp[[e, c]] > *limit).count();
            if n > 0 {
                counts.insert(epochs.ch_names[c].clone(), n);
            }
        }
    }
    counts
}

/// Channels that exceed their threshold in more than `fraction` of the epochs.
pub fn suggest_bads(counts: &BTreeMap<String, usize>, n_epochs: usize, fraction: f64) -> Vec<String> {
    if n_epochs == 0 {
        return Vec::new();
    }
    counts
        .iter()
        .filter(|(_, n)| **n as f64 / n_epochs as f64 > fraction)
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{Event, EventId};
    use ndarray::Array3;

    /// 20 identical sine epochs plus one positive and one negative spike.
    fn epochs_with_artifacts() -> Epochs {
        let n_epochs = 22;
        let n_times = 50;
        let mut data = Array3::from_shape_fn((n_epochs, 2, n_times), |(_, _, t)| {
            1e-5 * (2.0 * std::f64::consts::PI * t as f64 / 25.0).sin()
        });
        data[[5, 0, 20]] += 5e-4;
        data[[13, 0, 30]] -= 5e-4;
        let events = (0..n_epochs)
            .map(|i| Event {
                sample: 100 * i,
                prev: 0,
                code: 1,
            })
            .collect();
        let mut event_id = EventId::new();
        event_id.insert("cue".into(), 1);
        Epochs {
            data,
            events,
            event_id,
            tmin: 0.0,
            sfreq: 100.0,
            ch_names: vec!["Oz".into(), "O1".into()],
            ch_kinds: vec![ChannelKind::Eeg; 2],
            bads: Vec::new(),
            drop_log: vec![Vec::new(); n_epochs],
            selection: (0..n_epochs).collect(),
        }
    }

    #[test]
    fn threshold_excludes_artifacts_only() {
        let epochs = epochs_with_artifacts();
        let params = ThresholdParams {
            n_folds: 5,
            ..ThresholdParams::default()
        };
        let threshold = global_threshold(&epochs, ChannelKind::Eeg, &params)
            .unwrap()
            .unwrap();
        let clean = epochs.ptp()[[0, 0]];
        assert!(threshold >= clean);
        assert!(threshold < 4e-4);

        let mut thresholds = RejectThresholds::new();
        thresholds.insert(ChannelKind::Eeg, threshold);
        let mut epochs = epochs;
        assert_eq!(epochs.drop_bad(&thresholds), 2);
    }

    #[test]
    fn missing_kind_yields_no_threshold() {
        let epochs = epochs_with_artifacts();
        let found = estimate_thresholds(&epochs, &ThresholdParams::default()).unwrap();
        assert!(found.contains_key(&ChannelKind::Eeg));
        assert!(!found.contains_key(&ChannelKind::Eog));
    }

    #[test]
    fn per_channel_counts_and_suggestions() {
        let epochs = epochs_with_artifacts();
        let mut thresholds = RejectThresholds::new();
        thresholds.insert(ChannelKind::Eeg, 1e-4);
        let counts = bad_channel_counts(&epochs, &thresholds);
        assert_eq!(counts.get("Oz"), Some(&2));
        assert!(!counts.contains_key("O1"));
        assert!(suggest_bads(&counts, epochs.len(), 0.5).is_empty());
        assert_eq!(suggest_bads(&counts, epochs.len(), 0.05), vec!["Oz"]);
    }

    #[test]
    fn candidate_grid_is_sorted_and_bounded() {
        let values: Vec<f64> = (0..100).rev().map(|v| v as f64).collect();
        let grid = candidate_grid(&values, 5);
        assert_eq!(grid, vec![0.0, 24.0, 49.0, 74.0, 99.0]);
    }
}
