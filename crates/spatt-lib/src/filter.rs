//! Zero-phase FIR filtering and FFT resampling for continuous recordings.
use crate::error::{AnalysisError, AnalysisResult};
use crate::epochs::Evoked;
use crate::signal::{ChannelKind, Raw};
use log::debug;
use ndarray::{Array2, Axis};
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use std::f64::consts::PI;

/// Resolved FIR design, kept for logging and reports.
#[derive(Debug, Clone)]
pub struct FirDesign {
    pub l_freq: Option<f64>,
    pub h_freq: Option<f64>,
    pub l_trans_bandwidth: f64,
    pub h_trans_bandwidth: f64,
    pub taps: Vec<f64>,
}

fn auto_l_trans(l_freq: f64) -> f64 {
    (l_freq * 0.25).max(2.0).min(l_freq)
}

fn auto_h_trans(h_freq: f64, sfreq: f64) -> f64 {
    (h_freq * 0.25).max(2.0).min(sfreq / 2.0 - h_freq)
}

fn hamming(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Windowed-sinc low-pass with unit DC gain.
fn lowpass_taps(cutoff: f64, sfreq: f64, n: usize) -> Vec<f64> {
    let fc = cutoff / sfreq;
    let mid = (n - 1) as f64 / 2.0;
    let window = hamming(n);
    let mut taps: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - mid;
            let sinc = if x == 0.0 {
                2.0 * fc
            } else {
                (2.0 * PI * fc * x).sin() / (PI * x)
            };
            sinc * window[i]
        })
        .collect();
    let gain: f64 = taps.iter().sum();
    if gain != 0.0 {
        taps.iter_mut().for_each(|t| *t /= gain);
    }
    taps
}

/// Design a band-pass (both edges), high-pass (`h_freq = None`) or
/// low-pass (`l_freq = None`) Hamming FIR with automatic transition bands.
pub fn design_fir(l_freq: Option<f64>, h_freq: Option<f64>, sfreq: f64) -> AnalysisResult<FirDesign> {
    let nyquist = sfreq / 2.0;
    if let Some(l) = l_freq {
        if l <= 0.0 || l >= nyquist {
            return Err(AnalysisError::InvalidParameter(format!(
                "high-pass edge {} Hz outside (0, {})",
                l, nyquist
            )));
        }
    }
    if let Some(h) = h_freq {
        if h <= 0.0 || h >= nyquist {
            return Err(AnalysisError::InvalidParameter(format!(
                "low-pass edge {} Hz outside (0, {})",
                h, nyquist
            )));
        }
    }
    if let (Some(l), Some(h)) = (l_freq, h_freq) {
        if l >= h {
            return Err(AnalysisError::InvalidParameter(format!(
                "band edges reversed: {} >= {}",
                l, h
            )));
        }
    }
    let l_trans = l_freq.map(auto_l_trans).unwrap_or(0.0);
    let h_trans = h_freq.map(|h| auto_h_trans(h, sfreq)).unwrap_or(0.0);
    let min_trans = match (l_freq, h_freq) {
        (Some(_), Some(_)) => l_trans.min(h_trans),
        (Some(_), None) => l_trans,
        (None, Some(_)) => h_trans,
        (None, None) => {
            return Err(AnalysisError::InvalidParameter(
                "filter needs at least one band edge".into(),
            ))
        }
    };
    let mut n = (3.3 / min_trans * sfreq).ceil() as usize;
    if n % 2 == 0 {
        n += 1;
    }
    let taps = match (l_freq, h_freq) {
        (Some(l), Some(h)) => {
            let upper = lowpass_taps(h + h_trans / 2.0, sfreq, n);
            let lower = lowpass_taps(l - l_trans / 2.0, sfreq, n);
            upper.iter().zip(&lower).map(|(u, l)| u - l).collect()
        }
        (Some(l), None) => {
            let lower = lowpass_taps(l - l_trans / 2.0, sfreq, n);
            let mid = n / 2;
            lower
                .iter()
                .enumerate()
                .map(|(i, v)| if i == mid { 1.0 - v } else { -v })
                .collect()
        }
        (None, Some(h)) => lowpass_taps(h + h_trans / 2.0, sfreq, n),
        (None, None) => Vec::new(),
    };
    debug!(
        "FIR design l_freq={:?} h_freq={:?} taps={} l_trans={:.2} h_trans={:.2}",
        l_freq, h_freq, n, l_trans, h_trans
    );
    Ok(FirDesign {
        l_freq,
        h_freq,
        l_trans_bandwidth: l_trans,
        h_trans_bandwidth: h_trans,
        taps,
    })
}

/// Linear convolution trimmed to the input length, kernel centred (zero phase).
/// The signal is mirror-padded by half the kernel to soften edge transients.
pub fn convolve_same(signal: &[f64], kernel: &[f64]) -> AnalysisResult<Vec<f64>> {
    let n = signal.len();
    let m = kernel.len();
    if n == 0 || m == 0 {
        return Ok(signal.to_vec());
    }
    let pad = (m / 2).min(n.saturating_sub(1));
    let mut padded = Vec::with_capacity(n + 2 * pad);
    padded.extend((1..=pad).rev().map(|i| 2.0 * signal[0] - signal[i]));
    padded.extend_from_slice(signal);
    padded.extend((1..=pad).map(|i| 2.0 * signal[n - 1] - signal[n - 1 - i]));

    let full_len = padded.len() + m - 1;
    let nfft = full_len.next_power_of_two();
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(nfft);
    let c2r = planner.plan_fft_inverse(nfft);

    let mut a = r2c.make_input_vec();
    a[..padded.len()].copy_from_slice(&padded);
    let mut b = r2c.make_input_vec();
    b[..m].copy_from_slice(kernel);
    let mut spec_a = r2c.make_output_vec();
    let mut spec_b = r2c.make_output_vec();
    r2c.process(&mut a, &mut spec_a)
        .map_err(|e| AnalysisError::Fft(e.to_string()))?;
    r2c.process(&mut b, &mut spec_b)
        .map_err(|e| AnalysisError::Fft(e.to_string()))?;
    for (x, y) in spec_a.iter_mut().zip(&spec_b) {
        *x *= y;
    }
    clear_edge_imaginary(&mut spec_a);
    let mut out = c2r.make_output_vec();
    c2r.process(&mut spec_a, &mut out)
        .map_err(|e| AnalysisError::Fft(e.to_string()))?;
    let scale = 1.0 / nfft as f64;
    let offset = pad + (m - 1) / 2;
    Ok(out[offset..offset + n].iter().map(|v| v * scale).collect())
}

fn clear_edge_imaginary(spectrum: &mut [Complex<f64>]) {
    if let Some(first) = spectrum.first_mut() {
        first.im = 0.0;
    }
    if let Some(last) = spectrum.last_mut() {
        last.im = 0.0;
    }
}

/// Resample one channel to `n_out` samples by spectrum truncation or zero padding.
pub fn resample_fft(signal: &[f64], n_out: usize) -> AnalysisResult<Vec<f64>> {
    let n_in = signal.len();
    if n_in == 0 || n_out == 0 {
        return Ok(Vec::new());
    }
    if n_in == n_out {
        return Ok(signal.to_vec());
    }
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(n_in);
    let c2r = planner.plan_fft_inverse(n_out);
    let mut input = signal.to_vec();
    let mut spectrum = r2c.make_output_vec();
    r2c.process(&mut input, &mut spectrum)
        .map_err(|e| AnalysisError::Fft(e.to_string()))?;
    let mut resized = c2r.make_input_vec();
    let keep = resized.len().min(spectrum.len());
    resized[..keep].copy_from_slice(&spectrum[..keep]);
    // a bin that becomes the new Nyquist holds both halves of the old pair
    if n_out < n_in && n_out % 2 == 0 {
        if let Some(last) = resized.last_mut() {
            *last = Complex::new(last.re, 0.0);
        }
    }
    if n_out > n_in && n_in % 2 == 0 {
        let nyq = n_in / 2;
        resized[nyq] *= 0.5;
    }
    clear_edge_imaginary(&mut resized);
    let mut out = c2r.make_output_vec();
    c2r.process(&mut resized, &mut out)
        .map_err(|e| AnalysisError::Fft(e.to_string()))?;
    let scale = 1.0 / n_in as f64;
    Ok(out.into_iter().map(|v| v * scale).collect())
}

fn is_data_channel(kind: ChannelKind) -> bool {
    matches!(kind, ChannelKind::Eeg | ChannelKind::Eog | ChannelKind::Lfp)
}

impl Raw {
    /// Zero-phase FIR filter applied in place to EEG, EOG and LFP channels.
    pub fn filter(&mut self, l_freq: Option<f64>, h_freq: Option<f64>) -> AnalysisResult<FirDesign> {
        let design = design_fir(l_freq, h_freq, self.sfreq)?;
        for (idx, kind) in self.ch_kinds.iter().enumerate() {
            if !is_data_channel(*kind) {
                continue;
            }
            let row: Vec<f64> = self.data.row(idx).to_vec();
            let filtered = convolve_same(&row, &design.taps)?;
            self.data
                .row_mut(idx)
                .iter_mut()
                .zip(filtered)
                .for_each(|(dst, v)| *dst = v);
        }
        Ok(design)
    }

    /// Resample every channel to `sfreq`. Annotation onsets are in seconds and stay put.
    pub fn resample(&mut self, sfreq: f64) -> AnalysisResult<()> {
        if sfreq.is_nan() || sfreq <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "target sampling rate must be positive, got {}",
                sfreq
            )));
        }
        let n_out = (self.n_times() as f64 * sfreq / self.sfreq).round() as usize;
        let mut data = Array2::zeros((self.n_channels(), n_out));
        for (idx, row) in self.data.axis_iter(Axis(0)).enumerate() {
            let resampled = resample_fft(&row.to_vec(), n_out)?;
            data.row_mut(idx)
                .iter_mut()
                .zip(resampled)
                .for_each(|(dst, v)| *dst = v);
        }
        debug!("resampled {} Hz -> {} Hz ({} samples)", self.sfreq, sfreq, n_out);
        self.data = data;
        self.sfreq = sfreq;
        Ok(())
    }
}

impl Evoked {
    /// Zero-phase FIR filter of the averaged data channels.
    pub fn filter(&mut self, l_freq: Option<f64>, h_freq: Option<f64>) -> AnalysisResult<FirDesign> {
        let design = design_fir(l_freq, h_freq, self.sfreq)?;
        for (idx, kind) in self.ch_kinds.iter().enumerate() {
            if !is_data_channel(*kind) {
                continue;
            }
            let filtered = convolve_same(&self.data.row(idx).to_vec(), &design.taps)?;
            self.data
                .row_mut(idx)
                .iter_mut()
                .zip(filtered)
                .for_each(|(dst, v)| *dst = v);
        }
        Ok(design)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sfreq: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sfreq).sin())
            .collect()
    }

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    #[test]
    fn bandpass_keeps_passband_and_removes_drift() {
        let sfreq = 250.0;
        let n = 5000;
        let design = design_fir(Some(1.0), Some(10.0), sfreq).unwrap();
        assert_eq!(design.taps.len() % 2, 1);
        let pass = convolve_same(&sine(5.0, sfreq, n), &design.taps).unwrap();
        let stop = convolve_same(&sine(40.0, sfreq, n), &design.taps).unwrap();
        let mid = &pass[1000..4000];
        assert!((rms(mid) - 1.0 / 2f64.sqrt()).abs() < 0.02);
        assert!(rms(&stop[1000..4000]) < 0.01);
    }

    #[test]
    fn highpass_removes_offset() {
        let design = design_fir(Some(1.0), None, 100.0).unwrap();
        let flat = vec![3.0; 2000];
        let out = convolve_same(&flat, &design.taps).unwrap();
        assert!(out[500..1500].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn reversed_band_is_rejected() {
        assert!(design_fir(Some(20.0), Some(10.0), 250.0).is_err());
        assert!(design_fir(None, None, 250.0).is_err());
        assert!(design_fir(Some(1.0), Some(200.0), 250.0).is_err());
    }

    #[test]
    fn resample_preserves_tone() {
        let x = sine(5.0, 1000.0, 2000);
        let y = resample_fft(&x, 400).unwrap();
        assert_eq!(y.len(), 400);
        let expected = sine(5.0, 200.0, 400);
        for (a, b) in y.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn raw_resample_updates_rate() {
        let data = Array2::from_shape_fn((2, 1000), |(_, t)| (t as f64 * 0.01).sin());
        let mut raw = Raw::new(vec!["Cz".into(), "Pz".into()], 500.0, data).unwrap();
        raw.resample(250.0).unwrap();
        assert_eq!(raw.n_times(), 500);
        assert_eq!(raw.sfreq, 250.0);
    }

    #[test]
    fn evoked_lowpass_removes_fast_component() {
        let sfreq = 250.0;
        let slow = sine(3.0, sfreq, 1000);
        let fast = sine(60.0, sfreq, 1000);
        let data = Array2::from_shape_fn((1, 1000), |(_, t)| slow[t] + fast[t]);
        let mut evoked = Evoked {
            data,
            ch_names: vec!["Oz".into()],
            ch_kinds: vec![ChannelKind::Eeg],
            bads: Vec::new(),
            tmin: 0.0,
            sfreq,
            nave: 10,
            comment: String::new(),
        };
        evoked.filter(None, Some(30.0)).unwrap();
        let residual: Vec<f64> = (300..700).map(|t| evoked.data[[0, t]] - slow[t]).collect();
        assert!(rms(&residual) < 0.02);
    }
}
