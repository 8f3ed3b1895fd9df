use crate::annotations::{Annotation, Annotations};
use crate::error::{AnalysisError, AnalysisResult};
use ndarray::{s, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Basic typed single-channel series (LFP logger traces, EOG channels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Eeg,
    Eog,
    Lfp,
    Misc,
    Stim,
}

impl ChannelKind {
    /// Guess the kind from a channel label the way the lab montage names them.
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        if upper.contains("EOG") {
            ChannelKind::Eog
        } else if upper.starts_with("LFP") || upper.starts_with("STN") {
            ChannelKind::Lfp
        } else if upper.starts_with("STI") || upper == "TRIGGER" {
            ChannelKind::Stim
        } else {
            ChannelKind::Eeg
        }
    }
}

/// Channels present in every list, in the order of the first one.
pub fn common_channels<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut iter = lists.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut common = first.to_vec();
    for list in iter {
        common.retain(|name| list.contains(name));
    }
    common
}

/// Continuous multichannel recording, `data` is `[channel, sample]` in volts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Raw {
    pub ch_names: Vec<String>,
    pub ch_kinds: Vec<ChannelKind>,
    pub sfreq: f64,
    pub data: Array2<f64>,
    /// Recording time (s) of the first retained sample.
    pub first_time: f64,
    pub bads: Vec<String>,
    pub annotations: Annotations,
}

impl Raw {
    pub fn new(ch_names: Vec<String>, sfreq: f64, data: Array2<f64>) -> AnalysisResult<Self> {
        if ch_names.len() != data.nrows() {
            return Err(AnalysisError::GridMismatch {
                what: "channel names and data rows",
                left: ch_names.len().to_string(),
                right: data.nrows().to_string(),
            });
        }
        if sfreq.is_nan() || sfreq <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "sampling rate must be positive, got {}",
                sfreq
            )));
        }
        let ch_kinds = ch_names.iter().map(|n| ChannelKind::from_name(n)).collect();
        Ok(Self {
            ch_names,
            ch_kinds,
            sfreq,
            data,
            first_time: 0.0,
            bads: Vec::new(),
            annotations: Annotations::default(),
        })
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration(&self) -> f64 {
        self.n_times() as f64 / self.sfreq
    }

    /// Sample times relative to the first retained sample.
    pub fn times(&self) -> Vec<f64> {
        (0..self.n_times())
            .map(|i| i as f64 / self.sfreq)
            .collect()
    }

    /// Index of the sample nearest to `t` seconds after the first retained sample.
    pub fn time_to_index(&self, t: f64) -> usize {
        ((t * self.sfreq).round().max(0.0) as usize).min(self.n_times().saturating_sub(1))
    }

    pub fn channel_index(&self, name: &str) -> AnalysisResult<usize> {
        self.ch_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| AnalysisError::ChannelNotFound(name.to_string()))
    }

    pub fn channel(&self, name: &str) -> AnalysisResult<TimeSeries> {
        let idx = self.channel_index(name)?;
        Ok(TimeSeries {
            fs: self.sfreq,
            data: self.data.row(idx).to_vec(),
        })
    }

    pub fn set_kind(&mut self, name: &str, kind: ChannelKind) -> AnalysisResult<()> {
        let idx = self.channel_index(name)?;
        self.ch_kinds[idx] = kind;
        Ok(())
    }

    pub fn is_bad(&self, name: &str) -> bool {
        self.bads.iter().any(|b| b == name)
    }

    /// Indices of EEG channels not marked bad.
    pub fn good_eeg_indices(&self) -> Vec<usize> {
        self.ch_kinds
            .iter()
            .enumerate()
            .filter(|(i, kind)| **kind == ChannelKind::Eeg && !self.is_bad(&self.ch_names[*i]))
            .map(|(i, _)| i)
            .collect()
    }

    /// Add channels to `bads`. Unknown names are rejected, duplicates ignored.
    /// Returns how many channels were newly marked.
    pub fn mark_bads<S: AsRef<str>>(&mut self, names: &[S]) -> AnalysisResult<usize> {
        let mut added = 0;
        for name in names {
            let name = name.as_ref();
            self.channel_index(name)?;
            if !self.is_bad(name) {
                self.bads.push(name.to_string());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Keep only the named channels, in the given order.
    pub fn pick<S: AsRef<str>>(&self, names: &[S]) -> AnalysisResult<Raw> {
        let indices = names
            .iter()
            .map(|n| self.channel_index(n.as_ref()))
            .collect::<AnalysisResult<Vec<_>>>()?;
        Ok(self.select_indices(&indices))
    }

    pub fn pick_kind(&self, kind: ChannelKind) -> Raw {
        let indices: Vec<usize> = self
            .ch_kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == kind)
            .map(|(i, _)| i)
            .collect();
        self.select_indices(&indices)
    }

    fn select_indices(&self, indices: &[usize]) -> Raw {
        let ch_names: Vec<String> = indices.iter().map(|&i| self.ch_names[i].clone()).collect();
        let bads = self
            .bads
            .iter()
            .filter(|b| ch_names.contains(b))
            .cloned()
            .collect();
        Raw {
            ch_kinds: indices.iter().map(|&i| self.ch_kinds[i]).collect(),
            ch_names,
            sfreq: self.sfreq,
            data: self.data.select(Axis(0), indices),
            first_time: self.first_time,
            bads,
            annotations: self.annotations.clone(),
        }
    }

    /// Copy of the segment `[tmin, tmax]` (seconds from the first retained sample, inclusive).
    /// Annotations are clipped to the kept span.
    pub fn crop(&self, tmin: f64, tmax: Option<f64>) -> AnalysisResult<Raw> {
        let tmax = tmax.unwrap_or((self.n_times().saturating_sub(1)) as f64 / self.sfreq);
        if tmin < 0.0 || tmax < tmin || tmax > self.duration() + 1e-9 {
            return Err(AnalysisError::InvalidWindow { tmin, tmax });
        }
        let start = (tmin * self.sfreq).round() as usize;
        let stop = ((tmax * self.sfreq).round() as usize + 1).min(self.n_times());
        let mut out = self.clone();
        out.data = self.data.slice(s![.., start..stop]).to_owned();
        out.first_time = self.first_time + start as f64 / self.sfreq;
        let span_end = out.first_time + out.duration();
        out.annotations = self.annotations.clipped(out.first_time, span_end);
        Ok(out)
    }

    /// Join recordings end to end. Channels and sampling rate must agree.
    /// A `BAD boundary` / `EDGE boundary` pair marks every join.
    pub fn concatenate(parts: Vec<Raw>) -> AnalysisResult<Raw> {
        let mut iter = parts.into_iter();
        let mut out = iter
            .next()
            .ok_or_else(|| AnalysisError::EmptySelection("no recordings to concatenate".into()))?;
        for part in iter {
            if part.ch_names != out.ch_names {
                return Err(AnalysisError::GridMismatch {
                    what: "channel lists",
                    left: out.ch_names.join(","),
                    right: part.ch_names.join(","),
                });
            }
            if (part.sfreq - out.sfreq).abs() > 1e-9 {
                return Err(AnalysisError::GridMismatch {
                    what: "sampling rates",
                    left: out.sfreq.to_string(),
                    right: part.sfreq.to_string(),
                });
            }
            let join = out.first_time + out.duration();
            let shift = join - part.first_time;
            out.annotations.push(Annotation::new(join, 0.0, "BAD boundary"));
            out.annotations.push(Annotation::new(join, 0.0, "EDGE boundary"));
            for ann in part.annotations.iter() {
                out.annotations
                    .push(Annotation::new(ann.onset + shift, ann.duration, &ann.description));
            }
            for bad in part.bads {
                if !out.bads.contains(&bad) {
                    out.bads.push(bad);
                }
            }
            out.data = ndarray::concatenate(Axis(1), &[out.data.view(), part.data.view()])
                .map_err(|e| AnalysisError::InvalidParameter(e.to_string()))?;
        }
        Ok(out)
    }

    /// Subtract the mean of the good EEG channels from every EEG channel.
    pub fn set_average_reference(&mut self) -> AnalysisResult<()> {
        let good = self.good_eeg_indices();
        if good.is_empty() {
            return Err(AnalysisError::EmptySelection(
                "no good EEG channels for average reference".into(),
            ));
        }
        let reference = self
            .data
            .select(Axis(0), &good)
            .mean_axis(Axis(0))
            .ok_or_else(|| AnalysisError::EmptySelection("reference channels".into()))?;
        for (idx, kind) in self.ch_kinds.iter().enumerate() {
            if *kind == ChannelKind::Eeg {
                let mut row = self.data.row_mut(idx);
                row -= &reference;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n_ch: usize, n_t: usize, sfreq: f64) -> Raw {
        let names = (0..n_ch).map(|i| format!("C{}", i)).collect();
        let data = Array2::from_shape_fn((n_ch, n_t), |(c, t)| (c * 1000 + t) as f64);
        Raw::new(names, sfreq, data).unwrap()
    }

    #[test]
    fn crop_keeps_inclusive_window_and_tracks_first_time() {
        let raw = ramp(2, 1000, 100.0);
        let cropped = raw.crop(1.0, Some(2.0)).unwrap();
        assert_eq!(cropped.n_times(), 101);
        assert_eq!(cropped.data[[0, 0]], 100.0);
        assert!((cropped.first_time - 1.0).abs() < 1e-12);
        let again = cropped.crop(0.5, None).unwrap();
        assert!((again.first_time - 1.5).abs() < 1e-12);
    }

    #[test]
    fn crop_rejects_reversed_window() {
        let raw = ramp(1, 100, 100.0);
        assert!(raw.crop(0.5, Some(0.2)).is_err());
    }

    #[test]
    fn pick_unknown_channel_is_an_error() {
        let raw = ramp(3, 10, 100.0);
        match raw.pick(&["C1", "Oz"]) {
            Err(AnalysisError::ChannelNotFound(name)) => assert_eq!(name, "Oz"),
            other => panic!("unexpected {:?}", other.map(|r| r.ch_names)),
        }
    }

    #[test]
    fn pick_kind_selects_channels_by_montage_name() {
        let names = ["Oz", "VEOG", "HEOG", "STN_R"].iter().map(|s| s.to_string()).collect();
        let raw = Raw::new(names, 100.0, Array2::zeros((4, 10))).unwrap();
        let eog = raw.pick_kind(ChannelKind::Eog);
        assert_eq!(eog.ch_names, vec!["VEOG", "HEOG"]);
        assert_eq!(eog.data.nrows(), 2);
        assert_eq!(raw.pick_kind(ChannelKind::Lfp).ch_names, vec!["STN_R"]);
    }

    #[test]
    fn common_channels_follow_the_first_list() {
        let a: Vec<String> = ["PO3", "Cz", "Oz"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["Oz", "PO3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(common_channels([a.as_slice(), b.as_slice()]), vec!["PO3", "Oz"]);
        assert!(common_channels(std::iter::empty::<&[String]>()).is_empty());
    }

    #[test]
    fn concatenate_inserts_boundary_annotations() {
        let a = ramp(2, 100, 100.0);
        let b = ramp(2, 50, 100.0);
        let joined = Raw::concatenate(vec![a, b]).unwrap();
        assert_eq!(joined.n_times(), 150);
        let bounds: Vec<_> = joined
            .annotations
            .iter()
            .filter(|a| a.description.ends_with("boundary"))
            .collect();
        assert_eq!(bounds.len(), 2);
        assert!((bounds[0].onset - 1.0).abs() < 1e-12);
    }

    #[test]
    fn average_reference_zeroes_channel_mean() {
        let mut raw = ramp(4, 20, 100.0);
        raw.set_average_reference().unwrap();
        for t in 0..20 {
            let sum: f64 = raw.data.column(t).sum();
            assert!(sum.abs() < 1e-9);
        }
    }

    #[test]
    fn average_reference_skips_bad_channels() {
        let mut raw = ramp(3, 5, 100.0);
        raw.mark_bads(&["C2"]).unwrap();
        raw.set_average_reference().unwrap();
        // reference = mean(C0, C1) = t + 500
        assert!((raw.data[[0, 0]] + 500.0).abs() < 1e-9);
        assert!((raw.data[[2, 0]] - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn mark_bads_ignores_duplicates() {
        let mut raw = ramp(3, 5, 100.0);
        assert_eq!(raw.mark_bads(&["C1", "C1", "C2"]).unwrap(), 2);
        assert_eq!(raw.bads, vec!["C1", "C2"]);
        assert!(raw.mark_bads(&["FT10"]).is_err());
    }
}
