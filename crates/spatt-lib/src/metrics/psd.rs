use crate::epochs::Epochs;
use crate::error::{AnalysisError, AnalysisResult};
use crate::signal::Raw;
use ndarray::{Array2, Axis};
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WelchParams {
    /// Segment length in samples; shortened to the signal length if needed.
    pub n_fft: usize,
    pub n_overlap: usize,
    pub fmin: f64,
    pub fmax: f64,
}

impl Default for WelchParams {
    fn default() -> Self {
        Self {
            n_fft: 2048,
            n_overlap: 1024,
            fmin: 0.5,
            fmax: 60.0,
        }
    }
}

/// Power spectral density per channel, `data` is `[channel, freq]` in V²/Hz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Psd {
    pub ch_names: Vec<String>,
    pub freqs: Vec<f64>,
    pub data: Array2<f64>,
}

impl Psd {
    /// Sum of the density over `[fmin, fmax)` times the bin width, per channel.
    pub fn band_power(&self, fmin: f64, fmax: f64) -> Vec<f64> {
        let df = if self.freqs.len() > 1 {
            self.freqs[1] - self.freqs[0]
        } else {
            1.0
        };
        self.data
            .axis_iter(Axis(0))
            .map(|row| integrate_band(&self.freqs, row.as_slice().unwrap_or(&[]), (fmin, fmax)) * df)
            .collect()
    }

    /// Channel-mean spectrum.
    pub fn mean(&self) -> Vec<f64> {
        self.data
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_default()
    }
}

fn integrate_band(freqs: &[f64], powers: &[f64], band: (f64, f64)) -> f64 {
    freqs
        .iter()
        .zip(powers)
        .filter(|(f, _)| **f >= band.0 && **f < band.1)
        .map(|(_, p)| *p)
        .sum()
}

pub(crate) fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size as f64)).cos()))
        .collect()
}

/// One-sided Welch density estimate with a periodic Hann window and
/// per-segment mean removal.
pub fn welch(signal: &[f64], sfreq: f64, n_fft: usize, n_overlap: usize) -> AnalysisResult<(Vec<f64>, Vec<f64>)> {
    let n = signal.len();
    let window = n_fft.min(n);
    if window < 2 {
        return Err(AnalysisError::InvalidParameter(format!(
            "signal of {} samples is too short for a PSD",
            n
        )));
    }
    let step = window.saturating_sub(n_overlap.min(window - 1)).max(1);
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(window);
    let window_func = hann(window);
    let scale = 1.0 / (sfreq * window_func.iter().map(|w| w * w).sum::<f64>());
    let freqs: Vec<f64> = (0..=window / 2)
        .map(|k| k as f64 * sfreq / window as f64)
        .collect();
    let mut powers = vec![0.0; freqs.len()];
    let mut spectrum = r2c.make_output_vec();
    let mut pos = 0;
    let mut segments = 0;
    while pos + window <= n {
        let slice = &signal[pos..pos + window];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let mut frame: Vec<f64> = slice
            .iter()
            .zip(window_func.iter())
            .map(|(x, w)| (x - mean) * w)
            .collect();
        r2c.process(&mut frame, &mut spectrum)
            .map_err(|e| AnalysisError::Fft(e.to_string()))?;
        for (k, val) in spectrum.iter().enumerate() {
            let power = if k == 0 || (window % 2 == 0 && k == window / 2) {
                val.norm_sqr()
            } else {
                2.0 * val.norm_sqr()
            } * scale;
            powers[k] += power;
        }
        segments += 1;
        pos += step;
    }
    for p in powers.iter_mut() {
        *p /= segments as f64;
    }
    Ok((freqs, powers))
}

fn restrict(freqs: &[f64], fmin: f64, fmax: f64) -> Vec<usize> {
    freqs
        .iter()
        .enumerate()
        .filter(|(_, f)| **f >= fmin && **f <= fmax)
        .map(|(i, _)| i)
        .collect()
}

/// Welch PSD of the named channels of a continuous recording.
pub fn psd_raw(raw: &Raw, picks: &[usize], params: &WelchParams) -> AnalysisResult<Psd> {
    if picks.is_empty() {
        return Err(AnalysisError::EmptySelection("no channels picked for PSD".into()));
    }
    let mut rows = Vec::with_capacity(picks.len());
    let mut freqs = Vec::new();
    for &ch in picks {
        let trace = raw.data.row(ch).to_vec();
        let (f, p) = welch(&trace, raw.sfreq, params.n_fft, params.n_overlap)?;
        freqs = f;
        rows.push(p);
    }
    assemble(
        picks.iter().map(|&c| raw.ch_names[c].clone()).collect(),
        &freqs,
        &rows,
        params,
    )
}

/// Welch PSD per channel averaged over epochs.
pub fn psd_epochs(epochs: &Epochs, picks: &[usize], params: &WelchParams) -> AnalysisResult<Psd> {
    if picks.is_empty() || epochs.is_empty() {
        return Err(AnalysisError::EmptySelection("no epochs or channels for PSD".into()));
    }
    let mut rows = Vec::with_capacity(picks.len());
    let mut freqs = Vec::new();
    for &ch in picks {
        let mut acc: Vec<f64> = Vec::new();
        for epoch in epochs.data.axis_iter(Axis(0)) {
            let trace = epoch.row(ch).to_vec();
            let (f, p) = welch(&trace, epochs.sfreq, params.n_fft, params.n_overlap)?;
            if acc.is_empty() {
                acc = vec![0.0; p.len()];
            }
            acc.iter_mut().zip(&p).for_each(|(a, v)| *a += v);
            freqs = f;
        }
        acc.iter_mut().for_each(|a| *a /= epochs.len() as f64);
        rows.push(acc);
    }
    assemble(
        picks.iter().map(|&c| epochs.ch_names[c].clone()).collect(),
        &freqs,
        &rows,
        params,
    )
}

fn assemble(ch_names: Vec<String>, freqs: &[f64], rows: &[Vec<f64>], params: &WelchParams) -> AnalysisResult<Psd> {
    let keep = restrict(freqs, params.fmin, params.fmax);
    if keep.is_empty() {
        return Err(AnalysisError::EmptySelection(format!(
            "no PSD bins between {} and {} Hz",
            params.fmin, params.fmax
        )));
    }
    let data = Array2::from_shape_fn((rows.len(), keep.len()), |(c, k)| rows[c][keep[k]]);
    Ok(Psd {
        ch_names,
        freqs: keep.iter().map(|&k| freqs[k]).collect(),
        data,
    })
}
