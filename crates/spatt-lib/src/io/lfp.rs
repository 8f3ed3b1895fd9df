use crate::annotations::{Annotation, Annotations};
use crate::signal::{ChannelKind, Raw, TimeSeries};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Text rows the logger writes between the column header and the samples.
const PREAMBLE_ROWS: usize = 3;

/// One export of the stimulation device's LFP logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfpRecording {
    pub sfreq: f64,
    /// Sample counter as written by the device.
    pub samples: Vec<f64>,
    /// Amplitude in µV.
    pub amplitude: Vec<f64>,
    /// `(row, code)` for every row carrying a trigger tag.
    pub tags: Vec<(usize, i32)>,
}

impl LfpRecording {
    pub fn len(&self) -> usize {
        self.amplitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amplitude.is_empty()
    }

    /// Number of rows per tag code.
    pub fn tag_histogram(&self) -> BTreeMap<i32, usize> {
        let mut hist = BTreeMap::new();
        for (_, code) in &self.tags {
            *hist.entry(*code).or_insert(0) += 1;
        }
        hist
    }

    pub fn to_timeseries(&self) -> TimeSeries {
        TimeSeries {
            fs: self.sfreq,
            data: self.amplitude.clone(),
        }
    }

    /// Single-channel recording in volts with one annotation per tag (`tag/<code>`).
    pub fn to_raw(&self, ch_name: &str) -> Result<Raw> {
        let data = Array2::from_shape_fn((1, self.len()), |(_, t)| self.amplitude[t] * 1e-6);
        let mut raw = Raw::new(vec![ch_name.to_string()], self.sfreq, data)?;
        raw.ch_kinds[0] = ChannelKind::Lfp;
        raw.annotations = Annotations::new(
            self.tags
                .iter()
                .map(|(row, code)| {
                    Annotation::new(*row as f64 / self.sfreq, 0.0, &format!("tag/{}", code))
                })
                .collect(),
        );
        Ok(raw)
    }
}

/// Read a logger CSV (`sample, amplitude, tag_code`). The sampling rate is not
/// stored in the export and must be supplied.
pub fn read_lfp_csv(path: &Path, sfreq: f64) -> Result<LfpRecording> {
    if sfreq.is_nan() || sfreq <= 0.0 {
        return Err(anyhow!("LFP sampling rate must be positive, got {}", sfreq));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);
    let mut recording = LfpRecording {
        sfreq,
        samples: Vec::new(),
        amplitude: Vec::new(),
        tags: Vec::new(),
    };
    let mut skipped = 0usize;
    for (idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("reading record {}", idx + 2))?;
        if idx < PREAMBLE_ROWS {
            continue;
        }
        let sample = record.get(0).and_then(|v| v.trim().parse::<f64>().ok());
        let amplitude = record.get(1).and_then(|v| v.trim().parse::<f64>().ok());
        let (Some(sample), Some(amplitude)) = (sample, amplitude) else {
            skipped += 1;
            continue;
        };
        let row = recording.amplitude.len();
        if let Some(code) = record.get(2).and_then(|v| v.trim().parse::<i32>().ok()) {
            recording.tags.push((row, code));
        }
        recording.samples.push(sample);
        recording.amplitude.push(amplitude);
    }
    if recording.is_empty() {
        return Err(anyhow!("{} contains no numeric samples", path.display()));
    }
    info!(
        "read {}: {} samples at {} Hz (rate supplied by caller), {} tags, {} rows skipped",
        path.display(),
        recording.len(),
        sfreq,
        recording.tags.len(),
        skipped
    );
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture() -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .expect("workspace root")
            .join("test_data/lfp_logger.csv")
    }

    #[test]
    fn reads_logger_export() {
        let rec = read_lfp_csv(&fixture(), 1250.0).unwrap();
        assert_eq!(rec.len(), 10);
        assert_eq!(rec.amplitude[0], 12.5);
        let hist = rec.tag_histogram();
        assert_eq!(hist.get(&1), Some(&2));
        assert_eq!(hist.get(&4), Some(&1));
    }

    #[test]
    fn tags_become_annotations() {
        let rec = read_lfp_csv(&fixture(), 1250.0).unwrap();
        let raw = rec.to_raw("LFP-left").unwrap();
        assert_eq!(raw.ch_kinds[0], ChannelKind::Lfp);
        assert_eq!(raw.annotations.len(), 3);
        let first = raw.annotations.iter().next().unwrap();
        assert_eq!(first.description, "tag/1");
        assert!((first.onset - 2.0 / 1250.0).abs() < 1e-12);
    }

    #[test]
    fn sampling_rate_is_required() {
        assert!(read_lfp_csv(&fixture(), 0.0).is_err());
    }
}
