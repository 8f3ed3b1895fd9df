use crate::{
    annotations::blink_annotations,
    error::{AnalysisError, AnalysisResult},
    filter::{convolve_same, design_fir},
    signal::{ChannelKind, Raw},
};
use log::{debug, info};

/// Parameters for blink detection on an EOG trace.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EogConfig {
    /// Band-pass applied before peak picking (Hz).
    pub l_freq: f64,
    pub h_freq: f64,
    /// Peak threshold in volts; `None` uses a quarter of the filtered range.
    pub threshold: Option<f64>,
    /// Minimum spacing between kept blinks (seconds).
    pub min_gap_s: f64,
}

impl Default for EogConfig {
    fn default() -> Self {
        Self {
            l_freq: 1.0,
            h_freq: 10.0,
            threshold: None,
            min_gap_s: 1.0,
        }
    }
}

fn eog_channel(raw: &Raw, ch_name: Option<&str>) -> AnalysisResult<usize> {
    match ch_name {
        Some(name) => raw.channel_index(name),
        None => raw
            .ch_kinds
            .iter()
            .position(|k| *k == ChannelKind::Eog)
            .ok_or_else(|| AnalysisError::EmptySelection("recording has no EOG channel".into())),
    }
}

/// Sample indices of blink peaks on the EOG channel.
pub fn find_eog_events(raw: &Raw, ch_name: Option<&str>, cfg: &EogConfig) -> AnalysisResult<Vec<usize>> {
    let idx = eog_channel(raw, ch_name)?;
    let design = design_fir(Some(cfg.l_freq), Some(cfg.h_freq), raw.sfreq)?;
    let trace = raw.data.row(idx).to_vec();
    let mut filtered = convolve_same(&trace, &design.taps)?;
    if filtered.len() < 3 {
        return Ok(Vec::new());
    }
    let max = filtered.iter().cloned().fold(f64::MIN, f64::max);
    let min = filtered.iter().cloned().fold(f64::MAX, f64::min);
    // blinks may be recorded with either polarity; make the dominant one positive
    if min.abs() > max.abs() {
        filtered.iter_mut().for_each(|v| *v = -*v);
    }
    let threshold = cfg.threshold.unwrap_or((max - min) / 4.0);
    debug!(
        "EOG channel {} threshold {:.3e} V",
        raw.ch_names[idx], threshold
    );
    let peaks = pick_peaks(&filtered, threshold, (cfg.min_gap_s * raw.sfreq).round().max(1.0) as usize);
    Ok(peaks)
}

/// Local maxima above `threshold`; within `min_gap` samples only the larger one survives.
fn pick_peaks(data: &[f64], threshold: f64, min_gap: usize) -> Vec<usize> {
    let mut peaks: Vec<usize> = Vec::new();
    for i in 1..data.len() - 1 {
        let y = data[i];
        if y < threshold || y < data[i - 1] || y <= data[i + 1] {
            continue;
        }
        match peaks.last_mut() {
            Some(last) if i - *last < min_gap => {
                if y > data[*last] {
                    *last = i;
                }
            }
            _ => peaks.push(i),
        }
    }
    peaks
}

/// Detect blinks and add `blink` annotations to the recording. Returns the blink count.
pub fn annotate_blinks(raw: &mut Raw, ch_name: Option<&str>, cfg: &EogConfig) -> AnalysisResult<usize> {
    let peaks = find_eog_events(raw, ch_name, cfg)?;
    let blinks = blink_annotations(&peaks, raw.sfreq, raw.first_time);
    info!("found {} blinks", peaks.len());
    raw.annotations.extend(&blinks);
    Ok(peaks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn blink_recording(sfreq: f64, blink_times: &[f64], polarity: f64) -> Raw {
        let n = (20.0 * sfreq) as usize;
        let data = Array2::from_shape_fn((2, n), |(c, i)| {
            let t = i as f64 / sfreq;
            if c == 0 {
                return 1e-6 * (2.0 * std::f64::consts::PI * 10.0 * t).sin();
            }
            blink_times
                .iter()
                .map(|b| polarity * 150e-6 * (-((t - b) / 0.05).powi(2)).exp())
                .sum()
        });
        Raw::new(vec!["Cz".into(), "VEOG".into()], sfreq, data).unwrap()
    }

    #[test]
    fn detects_synthetic_blinks() {
        let raw = blink_recording(250.0, &[3.0, 7.5, 12.0], 1.0);
        let peaks = find_eog_events(&raw, None, &EogConfig::default()).unwrap();
        assert_eq!(peaks.len(), 3);
        assert!((peaks[1] as f64 / 250.0 - 7.5).abs() < 0.05);
    }

    #[test]
    fn negative_blinks_are_flipped() {
        let raw = blink_recording(250.0, &[4.0, 9.0], -1.0);
        let peaks = find_eog_events(&raw, Some("VEOG"), &EogConfig::default()).unwrap();
        assert_eq!(peaks.len(), 2);
    }

    #[test]
    fn blink_annotations_surround_peaks() {
        let mut raw = blink_recording(250.0, &[5.0], 1.0);
        assert_eq!(annotate_blinks(&mut raw, None, &EogConfig::default()).unwrap(), 1);
        let ann = raw.annotations.iter().next().unwrap();
        assert_eq!(ann.description, "blink");
        assert!((ann.onset - 4.75).abs() < 0.05);
        assert_eq!(ann.duration, 0.5);
    }

    #[test]
    fn missing_eog_channel_is_reported() {
        let data = Array2::zeros((1, 100));
        let raw = Raw::new(vec!["Cz".into()], 100.0, data).unwrap();
        assert!(find_eog_events(&raw, None, &EogConfig::default()).is_err());
    }
}
