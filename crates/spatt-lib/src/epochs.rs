//! Fixed-window epochs around events and their averages.
use crate::annotations::{Event, EventId};
use crate::baseline::{baseline_indices, rescale, BaselineMode};
use crate::error::{AnalysisError, AnalysisResult};
use crate::signal::{common_channels, ChannelKind, Raw};
use anyhow::Context;
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// What to do with several events on the same sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatedPolicy {
    Error,
    /// Keep the first event only.
    Drop,
    /// Combine into one event labelled `a/b` with a fresh code.
    #[default]
    Merge,
}

/// Peak-to-peak limits per channel kind, in volts.
pub type RejectThresholds = BTreeMap<ChannelKind, f64>;

#[derive(Debug, Clone)]
pub struct EpochParams {
    pub tmin: f64,
    pub tmax: f64,
    /// `Some(0)` removes the mean, `Some(1)` a linear trend.
    pub detrend: Option<u8>,
    pub baseline: Option<(Option<f64>, Option<f64>)>,
    pub reject_by_annotation: bool,
    pub event_repeated: RepeatedPolicy,
}

impl Default for EpochParams {
    fn default() -> Self {
        Self {
            tmin: -0.5,
            tmax: 1.5,
            detrend: Some(1),
            baseline: None,
            reject_by_annotation: true,
            event_repeated: RepeatedPolicy::Merge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epochs {
    /// `[epoch, channel, time]` in volts.
    pub data: Array3<f64>,
    pub events: Vec<Event>,
    pub event_id: EventId,
    pub tmin: f64,
    pub sfreq: f64,
    pub ch_names: Vec<String>,
    pub ch_kinds: Vec<ChannelKind>,
    pub bads: Vec<String>,
    /// One entry per candidate event; empty when the epoch was kept.
    pub drop_log: Vec<Vec<String>>,
    /// Index into `drop_log` of every kept epoch.
    pub selection: Vec<usize>,
}

fn resolve_repeats(
    events: Vec<Event>,
    event_id: &EventId,
    policy: RepeatedPolicy,
) -> AnalysisResult<(Vec<Event>, EventId)> {
    let mut event_id = event_id.clone();
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    let mut i = 0;
    while i < events.len() {
        let mut j = i + 1;
        while j < events.len() && events[j].sample == events[i].sample {
            j += 1;
        }
        if j - i == 1 {
            out.push(events[i]);
        } else {
            match policy {
                RepeatedPolicy::Error => return Err(AnalysisError::RepeatedEvent(events[i].sample)),
                RepeatedPolicy::Drop => out.push(events[i]),
                RepeatedPolicy::Merge => {
                    let mut labels: Vec<String> = events[i..j]
                        .iter()
                        .filter_map(|e| label_for(&event_id, e.code).map(str::to_string))
                        .collect();
                    labels.sort();
                    labels.dedup();
                    let merged = labels.join("/");
                    let code = match event_id.get(&merged) {
                        Some(code) => *code,
                        None => {
                            let code = event_id.values().copied().max().unwrap_or(0) + 1;
                            event_id.insert(merged.clone(), code);
                            code
                        }
                    };
                    debug!("merged {} events at sample {} into '{}'", j - i, events[i].sample, merged);
                    out.push(Event {
                        sample: events[i].sample,
                        prev: events[i].prev,
                        code,
                    });
                }
            }
        }
        i = j;
    }
    Ok((out, event_id))
}

fn label_for(event_id: &EventId, code: i32) -> Option<&str> {
    event_id
        .iter()
        .find(|(_, c)| **c == code)
        .map(|(label, _)| label.as_str())
}

/// Remove the mean (`order = 0`) or least-squares line (`order = 1`).
pub fn detrend(trace: &mut [f64], order: u8) {
    let n = trace.len();
    if n == 0 {
        return;
    }
    let mean = trace.iter().sum::<f64>() / n as f64;
    if order == 0 || n < 2 {
        trace.iter_mut().for_each(|v| *v -= mean);
        return;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, v) in trace.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxx += dx * dx;
        sxy += dx * (v - mean);
    }
    let slope = sxy / sxx;
    for (i, v) in trace.iter_mut().enumerate() {
        *v -= mean + slope * (i as f64 - x_mean);
    }
}

impl Epochs {
    /// Cut `[tmin, tmax]` windows around every event whose code appears in `event_id`.
    pub fn from_raw(raw: &Raw, events: &[Event], event_id: &EventId, params: &EpochParams) -> AnalysisResult<Epochs> {
        if params.tmax <= params.tmin {
            return Err(AnalysisError::InvalidWindow {
                tmin: params.tmin,
                tmax: params.tmax,
            });
        }
        let wanted: Vec<Event> = {
            let mut v: Vec<Event> = events
                .iter()
                .filter(|e| event_id.values().any(|c| *c == e.code))
                .copied()
                .collect();
            v.sort_by_key(|e| e.sample);
            v
        };
        if wanted.is_empty() {
            return Err(AnalysisError::EmptySelection(
                "no events match the requested event ids".into(),
            ));
        }
        let (wanted, event_id) = resolve_repeats(wanted, event_id, params.event_repeated)?;

        let offset = (params.tmin * raw.sfreq).round() as i64;
        let n_times = ((params.tmax - params.tmin) * raw.sfreq).round() as usize + 1;
        let mut drop_log = Vec::with_capacity(wanted.len());
        let mut kept_events = Vec::new();
        let mut selection = Vec::new();
        let mut segments = Vec::new();
        for (idx, event) in wanted.iter().enumerate() {
            let start = event.sample as i64 + offset;
            if start < 0 || start as usize + n_times > raw.n_times() {
                drop_log.push(vec!["NO_DATA".to_string()]);
                continue;
            }
            let start = start as usize;
            if params.reject_by_annotation {
                let t0 = raw.first_time + start as f64 / raw.sfreq;
                let t1 = raw.first_time + (start + n_times - 1) as f64 / raw.sfreq;
                if let Some(bad) = raw.annotations.overlaps_bad(t0, t1) {
                    drop_log.push(vec![bad.description.clone()]);
                    continue;
                }
            }
            let mut segment = raw.data.slice(s![.., start..start + n_times]).to_owned();
            for mut row in segment.axis_iter_mut(Axis(0)) {
                if let Some(slice) = row.as_slice_mut() {
                    if let Some(order) = params.detrend {
                        detrend(slice, order);
                    }
                }
            }
            segments.push(segment);
            drop_log.push(Vec::new());
            kept_events.push(*event);
            selection.push(idx);
        }
        let mut data = Array3::zeros((segments.len(), raw.n_channels(), n_times));
        for (i, seg) in segments.iter().enumerate() {
            data.slice_mut(s![i, .., ..]).assign(seg);
        }
        let mut epochs = Epochs {
            data,
            events: kept_events,
            event_id,
            tmin: offset as f64 / raw.sfreq,
            sfreq: raw.sfreq,
            ch_names: raw.ch_names.clone(),
            ch_kinds: raw.ch_kinds.clone(),
            bads: raw.bads.clone(),
            drop_log,
            selection,
        };
        if let Some((bmin, bmax)) = params.baseline {
            epochs.apply_baseline(bmin, bmax)?;
        }
        info!(
            "{} of {} epochs kept ({} samples each)",
            epochs.len(),
            epochs.drop_log.len(),
            n_times
        );
        Ok(epochs)
    }

    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn n_times(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.n_times())
            .map(|i| self.tmin + i as f64 / self.sfreq)
            .collect()
    }

    pub fn tmax(&self) -> f64 {
        self.tmin + (self.n_times().saturating_sub(1)) as f64 / self.sfreq
    }

    pub fn channel_index(&self, name: &str) -> AnalysisResult<usize> {
        self.ch_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| AnalysisError::ChannelNotFound(name.to_string()))
    }

    /// Keep only the named channels, in the given order.
    pub fn pick<S: AsRef<str>>(&self, names: &[S]) -> AnalysisResult<Epochs> {
        let indices = names
            .iter()
            .map(|n| self.channel_index(n.as_ref()))
            .collect::<AnalysisResult<Vec<_>>>()?;
        let mut out = self.clone();
        out.data = self.data.select(Axis(1), &indices);
        out.ch_names = indices.iter().map(|&i| self.ch_names[i].clone()).collect();
        out.ch_kinds = indices.iter().map(|&i| self.ch_kinds[i]).collect();
        out.bads.retain(|b| out.ch_names.contains(b));
        Ok(out)
    }

    /// Subtract the mean of `[bmin, bmax]` from each epoch and channel.
    pub fn apply_baseline(&mut self, bmin: Option<f64>, bmax: Option<f64>) -> AnalysisResult<()> {
        let range = baseline_indices(&self.times(), bmin, bmax)?;
        for mut epoch in self.data.axis_iter_mut(Axis(0)) {
            for mut row in epoch.axis_iter_mut(Axis(0)) {
                if let Some(slice) = row.as_slice_mut() {
                    rescale(slice, range.clone(), BaselineMode::Mean);
                }
            }
        }
        Ok(())
    }

    /// Labels in `event_id` matched by `label`: the exact key, or any key whose
    /// `/`-separated tags include it.
    fn matching_labels(&self, label: &str) -> Vec<&str> {
        self.event_id
            .keys()
            .filter(|key| key.as_str() == label || key.split('/').any(|tag| tag == label))
            .map(String::as_str)
            .collect()
    }

    fn keep(&self, indices: &[usize]) -> Epochs {
        let mut out = self.clone();
        out.data = self.data.select(Axis(0), indices);
        out.events = indices.iter().map(|&i| self.events[i]).collect();
        out.selection = indices.iter().map(|&i| self.selection[i]).collect();
        out
    }

    /// Epochs whose label matches any of `labels`. An unmatched label is an error.
    pub fn select<S: AsRef<str>>(&self, labels: &[S]) -> AnalysisResult<Epochs> {
        let mut keys: Vec<String> = Vec::new();
        for label in labels {
            let matched = self.matching_labels(label.as_ref());
            if matched.is_empty() {
                return Err(AnalysisError::UnknownCondition(label.as_ref().to_string()));
            }
            keys.extend(matched.into_iter().map(str::to_string));
        }
        let codes: Vec<i32> = keys.iter().filter_map(|k| self.event_id.get(k)).copied().collect();
        let indices: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| codes.contains(&e.code))
            .map(|(i, _)| i)
            .collect();
        let mut out = self.keep(&indices);
        out.event_id = keys
            .into_iter()
            .filter_map(|k| self.event_id.get(&k).map(|c| (k, *c)))
            .collect();
        Ok(out)
    }

    fn condition_indices(&self, label: &str) -> AnalysisResult<Vec<usize>> {
        let matched = self.matching_labels(label);
        if matched.is_empty() {
            return Err(AnalysisError::UnknownCondition(label.to_string()));
        }
        let codes: Vec<i32> = matched.iter().filter_map(|k| self.event_id.get(*k)).copied().collect();
        Ok(self
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| codes.contains(&e.code))
            .map(|(i, _)| i)
            .collect())
    }

    /// Drop epochs so both conditions have the same count. Epochs of the larger
    /// condition closest in time to the smaller condition's epochs survive.
    pub fn equalize_counts(&mut self, a: &str, b: &str) -> AnalysisResult<usize> {
        let ia = self.condition_indices(a)?;
        let ib = self.condition_indices(b)?;
        let (small, large) = if ia.len() <= ib.len() { (ia, ib) } else { (ib, ia) };
        if small.len() == large.len() {
            return Ok(0);
        }
        let mut used = vec![false; large.len()];
        for &s_idx in &small {
            let t = self.events[s_idx].sample as i64;
            let best = large
                .iter()
                .enumerate()
                .filter(|(k, _)| !used[*k])
                .min_by_key(|(_, l_idx)| (self.events[**l_idx].sample as i64 - t).abs())
                .map(|(k, _)| k);
            if let Some(k) = best {
                used[k] = true;
            }
        }
        let dropped: Vec<usize> = large
            .iter()
            .zip(&used)
            .filter(|(_, u)| !**u)
            .map(|(i, _)| *i)
            .collect();
        self.drop_epochs(&dropped, "EQUALIZED_COUNT");
        info!("equalized '{}' and '{}': dropped {} epochs", a, b, dropped.len());
        Ok(dropped.len())
    }

    /// Drop epochs by position, recording `reason` in the drop log.
    pub fn drop_epochs(&mut self, indices: &[usize], reason: &str) {
        for &i in indices {
            if let Some(&log_idx) = self.selection.get(i) {
                self.drop_log[log_idx].push(reason.to_string());
            }
        }
        let keep: Vec<usize> = (0..self.len()).filter(|i| !indices.contains(i)).collect();
        let kept = self.keep(&keep);
        *self = kept;
    }

    fn good_channels_of_kind(&self, kind: ChannelKind) -> Vec<usize> {
        self.ch_kinds
            .iter()
            .enumerate()
            .filter(|(i, k)| **k == kind && !self.bads.contains(&self.ch_names[*i]))
            .map(|(i, _)| i)
            .collect()
    }

    /// Peak-to-peak amplitude per epoch and channel.
    pub fn ptp(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.len(), self.n_channels()));
        for (e, epoch) in self.data.axis_iter(Axis(0)).enumerate() {
            for (c, row) in epoch.axis_iter(Axis(0)).enumerate() {
                let max = row.iter().cloned().fold(f64::MIN, f64::max);
                let min = row.iter().cloned().fold(f64::MAX, f64::min);
                out[[e, c]] = max - min;
            }
        }
        out
    }

    /// Drop epochs in which a good channel exceeds its kind's peak-to-peak limit.
    /// The offending channel names go to the drop log.
    pub fn drop_bad(&mut self, reject: &RejectThresholds) -> usize {
        let ptp = self.ptp();
        let mut bad_epochs = Vec::new();
        let mut reasons: Vec<Vec<String>> = Vec::new();
        for e in 0..self.len() {
            let mut offenders = Vec::new();
            for (kind, limit) in reject {
                for c in self.good_channels_of_kind(*kind) {
                    if ptp[[e, c]] > *limit {
                        offenders.push(self.ch_names[c].clone());
                    }
                }
            }
            if !offenders.is_empty() {
                bad_epochs.push(e);
                reasons.push(offenders);
            }
        }
        for (e, offenders) in bad_epochs.iter().zip(reasons) {
            let log_idx = self.selection[*e];
            self.drop_log[log_idx].extend(offenders);
        }
        let keep: Vec<usize> = (0..self.len()).filter(|i| !bad_epochs.contains(i)).collect();
        let kept = self.keep(&keep);
        *self = kept;
        if !bad_epochs.is_empty() {
            warn!("rejected {} epochs by peak-to-peak amplitude", bad_epochs.len());
        }
        bad_epochs.len()
    }

    /// How often each reason (channel name or annotation) appears in the drop log.
    pub fn drop_log_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.drop_log {
            for reason in entry {
                *counts.entry(reason.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Percentage of candidate epochs that were dropped.
    pub fn drop_percentage(&self) -> f64 {
        if self.drop_log.is_empty() {
            return 0.0;
        }
        let dropped = self.drop_log.iter().filter(|e| !e.is_empty()).count();
        100.0 * dropped as f64 / self.drop_log.len() as f64
    }

    pub fn mark_bads<S: AsRef<str>>(&mut self, names: &[S]) -> AnalysisResult<usize> {
        let mut added = 0;
        for name in names {
            let name = name.as_ref();
            self.channel_index(name)?;
            if !self.bads.iter().any(|b| b == name) {
                self.bads.push(name.to_string());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Join epochs recorded with the same montage and time grid.
    pub fn concatenate(parts: Vec<Epochs>) -> AnalysisResult<Epochs> {
        let mut iter = parts.into_iter();
        let mut out = iter
            .next()
            .ok_or_else(|| AnalysisError::EmptySelection("no epochs to concatenate".into()))?;
        for part in iter {
            if part.ch_names != out.ch_names {
                return Err(AnalysisError::GridMismatch {
                    what: "channel lists",
                    left: out.ch_names.join(","),
                    right: part.ch_names.join(","),
                });
            }
            if part.n_times() != out.n_times() || (part.tmin - out.tmin).abs() > 1e-9 {
                return Err(AnalysisError::GridMismatch {
                    what: "epoch time grids",
                    left: format!("{}+{}", out.tmin, out.n_times()),
                    right: format!("{}+{}", part.tmin, part.n_times()),
                });
            }
            for (label, code) in &part.event_id {
                match out.event_id.get(label) {
                    Some(existing) if existing != code => {
                        return Err(AnalysisError::GridMismatch {
                            what: "event codes",
                            left: format!("{}={}", label, existing),
                            right: format!("{}={}", label, code),
                        })
                    }
                    _ => {
                        out.event_id.insert(label.clone(), *code);
                    }
                }
            }
            let offset = out.drop_log.len();
            out.selection.extend(part.selection.iter().map(|s| s + offset));
            out.drop_log.extend(part.drop_log);
            out.events.extend(part.events);
            for bad in part.bads {
                if !out.bads.contains(&bad) {
                    out.bads.push(bad);
                }
            }
            out.data = ndarray::concatenate(Axis(0), &[out.data.view(), part.data.view()])
                .map_err(|e| AnalysisError::InvalidParameter(e.to_string()))?;
        }
        Ok(out)
    }

    /// Mean over epochs.
    pub fn average(&self) -> AnalysisResult<Evoked> {
        let data = self
            .data
            .mean_axis(Axis(0))
            .ok_or_else(|| AnalysisError::EmptySelection("cannot average zero epochs".into()))?;
        let comment = self.event_id.keys().cloned().collect::<Vec<_>>().join(" + ");
        Ok(Evoked {
            data,
            ch_names: self.ch_names.clone(),
            ch_kinds: self.ch_kinds.clone(),
            bads: self.bads.clone(),
            tmin: self.tmin,
            sfreq: self.sfreq,
            nave: self.len(),
            comment,
        })
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write epochs to {}", path.display()))
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Epochs> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse epochs from {}", path.display()))
    }
}

/// Channel × time average of epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evoked {
    pub data: Array2<f64>,
    pub ch_names: Vec<String>,
    pub ch_kinds: Vec<ChannelKind>,
    pub bads: Vec<String>,
    pub tmin: f64,
    pub sfreq: f64,
    pub nave: usize,
    pub comment: String,
}

impl Evoked {
    pub fn times(&self) -> Vec<f64> {
        (0..self.data.ncols())
            .map(|i| self.tmin + i as f64 / self.sfreq)
            .collect()
    }

    pub fn apply_baseline(&mut self, bmin: Option<f64>, bmax: Option<f64>) -> AnalysisResult<()> {
        let range = baseline_indices(&self.times(), bmin, bmax)?;
        for mut row in self.data.axis_iter_mut(Axis(0)) {
            if let Some(slice) = row.as_slice_mut() {
                rescale(slice, range.clone(), BaselineMode::Mean);
            }
        }
        Ok(())
    }

    /// Keep samples in `[tmin, tmax]` (inclusive).
    pub fn crop(&self, tmin: f64, tmax: f64) -> AnalysisResult<Evoked> {
        let range = baseline_indices(&self.times(), Some(tmin), Some(tmax))
            .map_err(|_| AnalysisError::InvalidWindow { tmin, tmax })?;
        let mut out = self.clone();
        out.tmin = self.tmin + range.start as f64 / self.sfreq;
        out.data = self.data.slice(s![.., range]).to_owned();
        Ok(out)
    }

    pub fn pick<S: AsRef<str>>(&self, names: &[S]) -> AnalysisResult<Evoked> {
        let indices = names
            .iter()
            .map(|n| {
                self.ch_names
                    .iter()
                    .position(|c| c == n.as_ref())
                    .ok_or_else(|| AnalysisError::ChannelNotFound(n.as_ref().to_string()))
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        let mut out = self.clone();
        out.data = self.data.select(Axis(0), &indices);
        out.ch_names = indices.iter().map(|&i| self.ch_names[i].clone()).collect();
        out.ch_kinds = indices.iter().map(|&i| self.ch_kinds[i]).collect();
        out.bads.retain(|b| out.ch_names.contains(b));
        Ok(out)
    }

    /// Equal-weight mean of evokeds sharing a time grid, over the channels
    /// every input has. A channel marked bad in any input is dropped.
    pub fn grand_average(items: &[Evoked]) -> AnalysisResult<Evoked> {
        let mut common = common_channels(items.iter().map(|e| e.ch_names.as_slice()));
        common.retain(|c| !items.iter().any(|e| e.bads.contains(c)));
        if items.is_empty() || common.is_empty() {
            return Err(AnalysisError::EmptySelection("no evoked channels shared by every input".into()));
        }
        let picked = items
            .iter()
            .map(|ev| {
                if ev.ch_names.len() != common.len() {
                    let dropped: Vec<&str> = ev
                        .ch_names
                        .iter()
                        .filter(|c| !common.contains(c))
                        .map(String::as_str)
                        .collect();
                    warn!("grand average drops {:?} from {}", dropped, ev.comment);
                }
                ev.pick(common.as_slice())
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        let first = &picked[0];
        let mut sum = Array2::<f64>::zeros(first.data.raw_dim());
        let mut nave = 0;
        for ev in &picked {
            if ev.data.dim() != first.data.dim() || (ev.tmin - first.tmin).abs() > 1e-9 {
                return Err(AnalysisError::GridMismatch {
                    what: "evoked time grids",
                    left: format!("{:?}", first.data.dim()),
                    right: format!("{:?}", ev.data.dim()),
                });
            }
            sum += &ev.data;
            nave += ev.nave;
        }
        let mut out = first.clone();
        out.data = sum / items.len() as f64;
        out.nave = nave;
        out.comment = format!("Grand average (n = {})", items.len());
        Ok(out)
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write evoked to {}", path.display()))
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Evoked> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse evoked from {}", path.display()))
    }
}
