//! Peak alpha frequency and the attention modulation index.
//!
//! The modulation index compares attend-right (`A`) with attend-left (`B`)
//! power as `(A - B) / (A + B + epsilon)` over a post-stimulus window and a
//! band centred on the subject's peak alpha frequency.
use crate::error::{AnalysisError, AnalysisResult};
use crate::tfr::AverageTfr;
use anyhow::Context;
use csv::WriterBuilder;
use log::{debug, info};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the peak alpha frequency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeakSource {
    /// Peak of the TFR computed over both conditions together.
    #[default]
    Both,
    /// Mean of the two per-condition peaks.
    ConditionMean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaParams {
    pub channels: Vec<String>,
    pub tmin: f64,
    pub tmax: f64,
    pub fmin: f64,
    pub fmax: f64,
    /// Half width of the peak alpha range in Hz, stepped by 1 Hz.
    pub half_width: u32,
    /// Added to every modulation-index denominator.
    pub epsilon: f64,
    pub peak_source: PeakSource,
}

impl Default for AlphaParams {
    fn default() -> Self {
        Self {
            channels: vec!["PO4".into(), "POz".into(), "PO3".into()],
            tmin: 0.3,
            tmax: 0.8,
            fmin: 8.0,
            fmax: 14.0,
            half_width: 2,
            epsilon: 0.0,
            peak_source: PeakSource::Both,
        }
    }
}

/// Peak of the channel- and time-averaged spectrum inside the search band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakAlpha {
    pub peak: f64,
    /// `peak - half_width ..= peak + half_width` in 1 Hz steps.
    pub range: Vec<f64>,
    pub freqs: Vec<f64>,
    pub spectrum: Vec<f64>,
}

pub fn alpha_range(peak: f64, half_width: u32) -> Vec<f64> {
    let hw = half_width as i64;
    (-hw..=hw).map(|d| peak + d as f64).collect()
}

/// Find the peak alpha frequency of one TFR.
pub fn peak_alpha(tfr: &AverageTfr, params: &AlphaParams) -> AnalysisResult<PeakAlpha> {
    let cropped = tfr
        .pick(params.channels.as_slice())?
        .crop(Some(params.tmin), Some(params.tmax), Some(params.fmin), Some(params.fmax))?;
    // mean |power| over channels, then time
    let spectrum: Vec<f64> = (0..cropped.freqs.len())
        .map(|f| {
            let plane = cropped.data.index_axis(Axis(1), f);
            plane.iter().map(|v| v.abs()).sum::<f64>() / plane.len() as f64
        })
        .collect();
    let best = spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| AnalysisError::EmptySelection("empty alpha band".into()))?;
    let peak = cropped.freqs[best];
    debug!("peak alpha {} Hz in {}..{} Hz", peak, params.fmin, params.fmax);
    Ok(PeakAlpha {
        peak,
        range: alpha_range(peak, params.half_width),
        freqs: cropped.freqs,
        spectrum,
    })
}

/// Peak alpha following `params.peak_source`. `both` is only consulted for
/// [`PeakSource::Both`].
pub fn estimate_paf(
    right: &AverageTfr,
    left: &AverageTfr,
    both: Option<&AverageTfr>,
    params: &AlphaParams,
) -> AnalysisResult<PeakAlpha> {
    let paf = match params.peak_source {
        PeakSource::Both => {
            let both = both.ok_or_else(|| {
                AnalysisError::InvalidParameter("peak source 'both' needs the combined TFR".into())
            })?;
            peak_alpha(both, params)?
        }
        PeakSource::ConditionMean => {
            let r = peak_alpha(right, params)?;
            let l = peak_alpha(left, params)?;
            let peak = 0.5 * (r.peak + l.peak);
            let spectrum = r.spectrum.iter().zip(&l.spectrum).map(|(a, b)| 0.5 * (a + b)).collect();
            PeakAlpha {
                peak,
                range: alpha_range(peak, params.half_width),
                freqs: r.freqs,
                spectrum,
            }
        }
    };
    info!("PAF {} Hz, range {:?}", paf.peak, paf.range);
    Ok(paf)
}

/// Elementwise `(a - b) / (a + b + epsilon)`. A zero denominator is an error.
pub fn modulation_index(a: &AverageTfr, b: &AverageTfr, epsilon: f64) -> AnalysisResult<Array3<f64>> {
    a.same_grid(b)?;
    let mut out = Array3::<f64>::zeros(a.data.raw_dim());
    for ((idx, va), vb) in a.data.indexed_iter().zip(b.data.iter()) {
        let denom = va + vb + epsilon;
        if denom == 0.0 {
            return Err(AnalysisError::ZeroDenominator {
                channel: idx.0,
                freq: idx.1,
                time: idx.2,
            });
        }
        out[idx] = (va - vb) / denom;
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiResult {
    pub ch_names: Vec<String>,
    pub freqs: Vec<f64>,
    pub times: Vec<f64>,
    /// Mean over frequencies and times.
    pub per_channel: Vec<f64>,
    /// Mean over channels and frequencies.
    pub series: Vec<f64>,
    /// Standard deviation across channels × frequencies per time point.
    pub std: Vec<f64>,
}

impl MiResult {
    pub fn mean(&self) -> f64 {
        if self.series.is_empty() {
            return 0.0;
        }
        self.series.iter().sum::<f64>() / self.series.len() as f64
    }
}

/// Modulation index of attend-right vs attend-left over the alpha channels,
/// the post-stimulus window and `[fmin, fmax]`.
pub fn compute_mi(
    right: &AverageTfr,
    left: &AverageTfr,
    fmin: f64,
    fmax: f64,
    params: &AlphaParams,
) -> AnalysisResult<MiResult> {
    let crop = |tfr: &AverageTfr| {
        tfr.pick(params.channels.as_slice())?
            .crop(Some(params.tmin), Some(params.tmax), Some(fmin), Some(fmax))
    };
    let a = crop(right)?;
    let b = crop(left)?;
    let mi = modulation_index(&a, &b, params.epsilon)?;
    let (n_ch, n_f, n_t) = mi.dim();
    let per_channel = mi
        .axis_iter(Axis(0))
        .map(|plane| plane.sum() / (n_f * n_t) as f64)
        .collect();
    let mut series = Vec::with_capacity(n_t);
    let mut std = Vec::with_capacity(n_t);
    for t in 0..n_t {
        let plane = mi.index_axis(Axis(2), t);
        let n = (n_ch * n_f) as f64;
        let mean = plane.sum() / n;
        let var = plane.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        series.push(mean);
        std.push(var.sqrt());
    }
    let result = MiResult {
        ch_names: a.ch_names,
        freqs: a.freqs,
        times: a.times,
        per_channel,
        series,
        std,
    };
    info!("MI mean {:.4} over {} channels", result.mean(), result.ch_names.len());
    Ok(result)
}

/// `ch_name,mi` per channel.
pub fn write_mi_csv(path: &Path, result: &MiResult) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["ch_name", "mi"])?;
    for (name, mi) in result.ch_names.iter().zip(&result.per_channel) {
        writer.write_record([name.clone(), mi.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// `time,mi,std` per time point.
pub fn write_mi_series_csv(path: &Path, result: &MiResult) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["time", "mi", "std"])?;
    for ((t, mi), sd) in result.times.iter().zip(&result.series).zip(&result.std) {
        writer.write_record([t.to_string(), mi.to_string(), sd.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Stimulation effect on baseline-corrected power.
#[derive(Debug, Clone)]
pub struct StimEffect {
    /// `no_stim - stim`.
    pub difference: AverageTfr,
    /// `(no_stim - stim) / (no_stim + stim + epsilon)`.
    pub ratio: AverageTfr,
}

pub fn stim_effect(no_stim: &AverageTfr, stim: &AverageTfr, epsilon: f64) -> AnalysisResult<StimEffect> {
    let ratio = modulation_index(no_stim, stim, epsilon)?;
    let mut difference = no_stim.clone();
    difference.data = &no_stim.data - &stim.data;
    difference.comment = "no_stim - stim".into();
    let mut ratio_tfr = no_stim.clone();
    ratio_tfr.data = ratio;
    ratio_tfr.comment = "(no_stim - stim) / (no_stim + stim)".into();
    Ok(StimEffect {
        difference,
        ratio: ratio_tfr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["PO4".into(), "POz".into(), "PO3".into(), "Fz".into()]
    }

    /// Power with a Gaussian bump at `peak` Hz, scaled by `gain`.
    fn synthetic_tfr(peak: f64, gain: f64) -> AverageTfr {
        let freqs: Vec<f64> = (2..=30).map(|f| f as f64).collect();
        let times: Vec<f64> = (0..201).map(|i| -0.5 + i as f64 * 0.01).collect();
        let data = Array3::from_shape_fn((4, freqs.len(), times.len()), |(c, f, _)| {
            let freq = freqs[f];
            gain * (1.0 + c as f64 * 0.1) * (1.0 + 5.0 * (-(freq - peak).powi(2) / 2.0).exp())
        });
        AverageTfr {
            data,
            ch_names: names(),
            freqs,
            times,
            nave: 40,
            comment: "synthetic".into(),
        }
    }

    #[test]
    fn identical_spectra_give_zero_mi() {
        let tfr = synthetic_tfr(10.0, 1.0);
        let mi = modulation_index(&tfr, &tfr, 0.0).unwrap();
        assert!(mi.iter().all(|v| *v == 0.0));
        let result = compute_mi(&tfr, &tfr, 8.0, 12.0, &AlphaParams::default()).unwrap();
        assert!(result.per_channel.iter().all(|v| *v == 0.0));
        assert!(result.series.iter().all(|v| *v == 0.0));
        assert!(result.std.iter().all(|v| *v == 0.0));
        assert_eq!(result.times.len(), 51);
        assert_eq!(result.freqs, vec![8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn peak_matches_the_synthetic_bump() {
        let paf = peak_alpha(&synthetic_tfr(11.0, 1.0), &AlphaParams::default()).unwrap();
        assert_eq!(paf.peak, 11.0);
        assert_eq!(paf.range, vec![9.0, 10.0, 11.0, 12.0, 13.0]);
        assert_eq!(paf.freqs.first().copied(), Some(8.0));
    }

    #[test]
    fn condition_mean_averages_the_peaks() {
        let params = AlphaParams {
            peak_source: PeakSource::ConditionMean,
            ..AlphaParams::default()
        };
        let paf = estimate_paf(&synthetic_tfr(9.0, 1.0), &synthetic_tfr(12.0, 1.0), None, &params).unwrap();
        assert_eq!(paf.peak, 10.5);
        assert_eq!(paf.range[0], 8.5);
        let both = AlphaParams::default();
        assert!(estimate_paf(&synthetic_tfr(9.0, 1.0), &synthetic_tfr(12.0, 1.0), None, &both).is_err());
    }

    #[test]
    fn stronger_right_power_gives_positive_mi() {
        let right = synthetic_tfr(10.0, 3.0);
        let left = synthetic_tfr(10.0, 1.0);
        let result = compute_mi(&right, &left, 8.0, 12.0, &AlphaParams::default()).unwrap();
        for mi in &result.per_channel {
            assert!((mi - 0.5).abs() < 1e-12);
        }
        assert_eq!(result.ch_names, vec!["PO4", "POz", "PO3"]);
    }

    #[test]
    fn zero_denominator_is_reported() {
        let mut a = synthetic_tfr(10.0, 1.0);
        let mut b = a.clone();
        a.data[[1, 3, 7]] = 2.0;
        b.data[[1, 3, 7]] = -2.0;
        match modulation_index(&a, &b, 0.0) {
            Err(AnalysisError::ZeroDenominator { channel, freq, time }) => {
                assert_eq!((channel, freq, time), (1, 3, 7));
            }
            other => panic!("expected ZeroDenominator, got {other:?}"),
        }
        assert!(modulation_index(&a, &b, 1e-10).is_ok());
    }

    #[test]
    fn misnamed_channels_and_grids_are_errors() {
        let tfr = synthetic_tfr(10.0, 1.0);
        let params = AlphaParams {
            channels: vec!["PO7".into()],
            ..AlphaParams::default()
        };
        assert!(matches!(
            compute_mi(&tfr, &tfr, 8.0, 12.0, &params),
            Err(AnalysisError::ChannelNotFound(_))
        ));
        let shorter = tfr.crop(None, Some(0.5), None, None).unwrap();
        assert!(matches!(
            modulation_index(&tfr, &shorter, 0.0),
            Err(AnalysisError::GridMismatch { .. })
        ));
    }

    #[test]
    fn stim_effect_difference_and_ratio() {
        let no_stim = synthetic_tfr(10.0, 2.0);
        let stim = synthetic_tfr(10.0, 1.0);
        let effect = stim_effect(&no_stim, &stim, 0.0).unwrap();
        let d = &effect.difference.data;
        assert!((d[[0, 0, 0]] - stim.data[[0, 0, 0]]).abs() < 1e-12);
        assert!((effect.ratio.data[[2, 5, 9]] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn mi_csv_has_one_row_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mi.csv");
        let tfr = synthetic_tfr(10.0, 1.0);
        let result = compute_mi(&tfr, &tfr, 8.0, 12.0, &AlphaParams::default()).unwrap();
        write_mi_csv(&path, &result).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ch_name,mi");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("PO4,"));
    }
}
