//! Multitaper time-frequency power.
//!
//! Each frequency gets a complex exponential of `n_cycles / f` seconds,
//! tapered by DPSS windows and convolved with every epoch. Power is the
//! squared magnitude averaged over tapers and epochs.
use crate::baseline::{baseline_indices, rescale, BaselineMode};
use crate::epochs::Epochs;
use crate::error::{AnalysisError, AnalysisResult};
use crate::signal::common_channels;
use anyhow::Context;
use log::{debug, info, warn};
use ndarray::{s, Array3, Axis};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfrParams {
    pub freqs: Vec<f64>,
    /// One entry per frequency.
    pub n_cycles: Vec<f64>,
    pub time_bandwidth: f64,
    pub zero_mean: bool,
    pub decim: usize,
}

impl TfrParams {
    /// `fmin..=fmax` in `fstep` steps with `n_cycles = f / 2`.
    pub fn linear(fmin: f64, fmax: f64, fstep: f64) -> AnalysisResult<Self> {
        if fstep <= 0.0 || fmin <= 0.0 || fmax < fmin {
            return Err(AnalysisError::InvalidParameter(format!(
                "frequency grid {}..{} step {} is empty",
                fmin, fmax, fstep
            )));
        }
        let n = ((fmax - fmin) / fstep + 1e-9).floor() as usize + 1;
        let freqs: Vec<f64> = (0..n).map(|i| fmin + i as f64 * fstep).collect();
        Ok(Self::with_freqs(freqs))
    }

    pub fn with_freqs(freqs: Vec<f64>) -> Self {
        let n_cycles = freqs.iter().map(|f| f / 2.0).collect();
        Self {
            freqs,
            n_cycles,
            time_bandwidth: 2.0,
            zero_mean: true,
            decim: 1,
        }
    }

    pub fn n_tapers(&self) -> usize {
        ((self.time_bandwidth - 1.0).floor() as usize).max(1)
    }
}

/// Eigenvalues of the symmetric tridiagonal matrix below `x`.
fn sturm_count(diag: &[f64], off: &[f64], x: f64) -> usize {
    let mut count = 0;
    let mut q = diag[0] - x;
    if q < 0.0 {
        count += 1;
    }
    for i in 1..diag.len() {
        let prev = if q == 0.0 { f64::EPSILON * (1.0 + x.abs()) } else { q };
        q = diag[i] - x - off[i - 1] * off[i - 1] / prev;
        if q < 0.0 {
            count += 1;
        }
    }
    count
}

/// `j`-th smallest eigenvalue by bisection.
fn tridiagonal_eigenvalue(diag: &[f64], off: &[f64], j: usize) -> f64 {
    let n = diag.len();
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for i in 0..n {
        let radius = if i > 0 { off[i - 1].abs() } else { 0.0 } + if i + 1 < n { off[i].abs() } else { 0.0 };
        lo = lo.min(diag[i] - radius);
        hi = hi.max(diag[i] + radius);
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if sturm_count(diag, off, mid) > j {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Solve `(T - shift) x = rhs` for a symmetric tridiagonal `T`.
fn tridiagonal_solve(diag: &[f64], off: &[f64], shift: f64, rhs: &[f64]) -> Vec<f64> {
    let n = diag.len();
    let tiny = f64::EPSILON * diag.iter().fold(1.0_f64, |m, d| m.max(d.abs()));
    let mut c = vec![0.0; n];
    let mut d = vec![0.0; n];
    let mut pivot = diag[0] - shift;
    if pivot.abs() < tiny {
        pivot = tiny;
    }
    if n > 1 {
        c[0] = off[0] / pivot;
    }
    d[0] = rhs[0] / pivot;
    for i in 1..n {
        pivot = diag[i] - shift - off[i - 1] * c[i - 1];
        if pivot.abs() < tiny {
            pivot = tiny;
        }
        if i + 1 < n {
            c[i] = off[i] / pivot;
        }
        d[i] = (rhs[i] - off[i - 1] * d[i - 1]) / pivot;
    }
    let mut x = vec![0.0; n];
    x[n - 1] = d[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = d[i] - c[i] * x[i + 1];
    }
    x
}

fn normalize(v: &mut [f64]) {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Discrete prolate spheroidal sequences of length `n`, unit 2-norm.
///
/// With `sym = false` the sequences are computed for `n + 1` points and the
/// last point dropped, which suits spectral use.
pub fn dpss(n: usize, half_nbw: f64, k: usize, sym: bool) -> Vec<Vec<f64>> {
    let m = if sym { n } else { n + 1 };
    if m == 0 || k == 0 {
        return Vec::new();
    }
    if m == 1 {
        return vec![vec![1.0; n]; k];
    }
    let w = half_nbw / m as f64;
    let diag: Vec<f64> = (0..m)
        .map(|i| ((m as f64 - 1.0 - 2.0 * i as f64) / 2.0).powi(2) * (2.0 * PI * w).cos())
        .collect();
    let off: Vec<f64> = (1..m).map(|i| i as f64 * (m - i) as f64 / 2.0).collect();
    let thresh = (1.0 / m as f64).max(1e-7);

    (0..k.min(m))
        .map(|order| {
            let lambda = tridiagonal_eigenvalue(&diag, &off, m - 1 - order);
            let mut v: Vec<f64> = (0..m)
                .map(|i| (PI * (order + 1) as f64 * (i + 1) as f64 / (m + 1) as f64).sin() + 1e-3)
                .collect();
            for _ in 0..4 {
                v = tridiagonal_solve(&diag, &off, lambda, &v);
                normalize(&mut v);
            }
            let flip = if order % 2 == 0 {
                v.iter().sum::<f64>() < 0.0
            } else {
                v.iter().find(|x| **x * **x > thresh).is_some_and(|x| *x < 0.0)
            };
            if flip {
                v.iter_mut().for_each(|x| *x = -*x);
            }
            v.truncate(n);
            v
        })
        .collect()
}

/// Tapered complex wavelets, indexed `[taper][freq]`.
pub fn multitaper_wavelets(sfreq: f64, params: &TfrParams) -> AnalysisResult<Vec<Vec<Vec<Complex<f64>>>>> {
    if params.n_cycles.len() != params.freqs.len() {
        return Err(AnalysisError::GridMismatch {
            what: "n_cycles and freqs",
            left: params.n_cycles.len().to_string(),
            right: params.freqs.len().to_string(),
        });
    }
    let n_tapers = params.n_tapers();
    let mut out = vec![Vec::with_capacity(params.freqs.len()); n_tapers];
    for (&freq, &cycles) in params.freqs.iter().zip(&params.n_cycles) {
        if freq <= 0.0 || cycles <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "frequency {} with {} cycles",
                freq, cycles
            )));
        }
        let t_win = cycles / freq;
        let len = ((t_win * sfreq) - 1e-9).ceil().max(1.0) as usize;
        let tapers = dpss(len, params.time_bandwidth / 2.0, n_tapers, false);
        for (taper_idx, taper) in tapers.iter().enumerate() {
            let mut wavelet: Vec<Complex<f64>> = taper
                .iter()
                .enumerate()
                .map(|(i, &w)| {
                    let t = i as f64 / sfreq - t_win / 2.0;
                    Complex::from_polar(w, 2.0 * PI * freq * t)
                })
                .collect();
            if params.zero_mean {
                let mean = wavelet.iter().sum::<Complex<f64>>() / len as f64;
                wavelet.iter_mut().for_each(|z| *z -= mean);
            }
            let norm = wavelet.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt() * 0.5_f64.sqrt();
            wavelet.iter_mut().for_each(|z| *z /= norm);
            out[taper_idx].push(wavelet);
        }
    }
    Ok(out)
}

/// Linear convolution of a real signal with a complex kernel, returning the
/// centred `signal.len()` samples.
fn convolve_same(planner: &mut FftPlanner<f64>, signal: &[f64], kernel: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let n = signal.len();
    let nfft = n + kernel.len() - 1;
    let fft = planner.plan_fft_forward(nfft);
    let ifft = planner.plan_fft_inverse(nfft);
    let mut x: Vec<Complex<f64>> = signal.iter().map(|&v| Complex::new(v, 0.0)).collect();
    x.resize(nfft, Complex::new(0.0, 0.0));
    let mut h = kernel.to_vec();
    h.resize(nfft, Complex::new(0.0, 0.0));
    fft.process(&mut x);
    fft.process(&mut h);
    for (a, b) in x.iter_mut().zip(&h) {
        *a *= *b;
    }
    ifft.process(&mut x);
    let start = (kernel.len() - 1) / 2;
    x[start..start + n]
        .iter()
        .map(|z| *z / nfft as f64)
        .collect()
}

/// Channel × frequency × time power averaged over epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AverageTfr {
    pub data: Array3<f64>,
    pub ch_names: Vec<String>,
    pub freqs: Vec<f64>,
    pub times: Vec<f64>,
    pub nave: usize,
    pub comment: String,
}

/// Multitaper power of the `picks` channels, averaged over all epochs.
pub fn tfr_multitaper(epochs: &Epochs, picks: &[usize], params: &TfrParams) -> AnalysisResult<AverageTfr> {
    if epochs.is_empty() {
        return Err(AnalysisError::EmptySelection("no epochs for TFR".into()));
    }
    if picks.is_empty() {
        return Err(AnalysisError::EmptySelection("no channels for TFR".into()));
    }
    if params.decim == 0 {
        return Err(AnalysisError::InvalidParameter("decim must be at least 1".into()));
    }
    let wavelets = multitaper_wavelets(epochs.sfreq, params)?;
    let n_times = epochs.n_times();
    for (f_idx, w) in wavelets[0].iter().enumerate() {
        if w.len() > n_times {
            return Err(AnalysisError::WaveletTooLong {
                freq: params.freqs[f_idx],
                wavelet: w.len(),
                signal: n_times,
            });
        }
    }
    debug!(
        "multitaper TFR: {} freqs, {} tapers, decim {}",
        params.freqs.len(),
        wavelets.len(),
        params.decim
    );
    let kept: Vec<usize> = (0..n_times).step_by(params.decim).collect();
    let mut power = Array3::<f64>::zeros((picks.len(), params.freqs.len(), kept.len()));
    let mut planner = FftPlanner::new();
    let weight = 1.0 / (wavelets.len() * epochs.len()) as f64;
    for epoch in epochs.data.axis_iter(Axis(0)) {
        for (p, &ch) in picks.iter().enumerate() {
            let trace = epoch.row(ch).to_vec();
            for taper in &wavelets {
                for (f_idx, wavelet) in taper.iter().enumerate() {
                    let coefs = convolve_same(&mut planner, &trace, wavelet);
                    for (t_idx, &t) in kept.iter().enumerate() {
                        power[[p, f_idx, t_idx]] += coefs[t].norm_sqr() * weight;
                    }
                }
            }
        }
    }
    let all_times = epochs.times();
    let comment = epochs.event_id.keys().cloned().collect::<Vec<_>>().join(" + ");
    info!(
        "TFR over {} epochs, {} channels ({})",
        epochs.len(),
        picks.len(),
        comment
    );
    Ok(AverageTfr {
        data: power,
        ch_names: picks.iter().map(|&c| epochs.ch_names[c].clone()).collect(),
        freqs: params.freqs.clone(),
        times: kept.iter().map(|&t| all_times[t]).collect(),
        nave: epochs.len(),
        comment,
    })
}

fn inclusive_range(values: &[f64], lo: Option<f64>, hi: Option<f64>, what: &str) -> AnalysisResult<std::ops::Range<usize>> {
    baseline_indices(values, lo, hi).map_err(|_| {
        AnalysisError::EmptySelection(format!(
            "no {} in [{}, {}]",
            what,
            lo.map_or("-inf".to_string(), |v| v.to_string()),
            hi.map_or("inf".to_string(), |v| v.to_string())
        ))
    })
}

impl AverageTfr {
    pub fn channel_indices<S: AsRef<str>>(&self, names: &[S]) -> AnalysisResult<Vec<usize>> {
        names
            .iter()
            .map(|n| {
                self.ch_names
                    .iter()
                    .position(|c| c == n.as_ref())
                    .ok_or_else(|| AnalysisError::ChannelNotFound(n.as_ref().to_string()))
            })
            .collect()
    }

    /// Keep times and frequencies inside the given bounds (inclusive).
    pub fn crop(
        &self,
        tmin: Option<f64>,
        tmax: Option<f64>,
        fmin: Option<f64>,
        fmax: Option<f64>,
    ) -> AnalysisResult<AverageTfr> {
        let t = inclusive_range(&self.times, tmin, tmax, "times")?;
        let f = inclusive_range(&self.freqs, fmin, fmax, "frequencies")?;
        Ok(AverageTfr {
            data: self.data.slice(s![.., f.clone(), t.clone()]).to_owned(),
            ch_names: self.ch_names.clone(),
            freqs: self.freqs[f].to_vec(),
            times: self.times[t].to_vec(),
            nave: self.nave,
            comment: self.comment.clone(),
        })
    }

    pub fn pick<S: AsRef<str>>(&self, names: &[S]) -> AnalysisResult<AverageTfr> {
        let indices = self.channel_indices(names)?;
        Ok(AverageTfr {
            data: self.data.select(Axis(0), &indices),
            ch_names: indices.iter().map(|&i| self.ch_names[i].clone()).collect(),
            freqs: self.freqs.clone(),
            times: self.times.clone(),
            nave: self.nave,
            comment: self.comment.clone(),
        })
    }

    /// Rescale every channel/frequency trace against `[bmin, bmax]`.
    pub fn apply_baseline(&mut self, bmin: Option<f64>, bmax: Option<f64>, mode: BaselineMode) -> AnalysisResult<()> {
        let range = baseline_indices(&self.times, bmin, bmax)?;
        for mut channel in self.data.axis_iter_mut(Axis(0)) {
            for mut row in channel.axis_iter_mut(Axis(0)) {
                let mut trace = row.to_vec();
                rescale(&mut trace, range.clone(), mode);
                row.iter_mut().zip(trace).for_each(|(dst, v)| *dst = v);
            }
        }
        debug!("TFR baseline {:?}..{:?} ({:?})", bmin, bmax, mode);
        Ok(())
    }

    pub fn same_grid(&self, other: &AverageTfr) -> AnalysisResult<()> {
        if self.ch_names != other.ch_names {
            return Err(AnalysisError::GridMismatch {
                what: "channel lists",
                left: self.ch_names.join(","),
                right: other.ch_names.join(","),
            });
        }
        let close = |a: &[f64], b: &[f64]| a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9);
        if !close(&self.freqs, &other.freqs) {
            return Err(AnalysisError::GridMismatch {
                what: "frequency grids",
                left: format!("{:?}", self.freqs),
                right: format!("{:?}", other.freqs),
            });
        }
        if !close(&self.times, &other.times) {
            return Err(AnalysisError::GridMismatch {
                what: "time grids",
                left: format!("{} samples", self.times.len()),
                right: format!("{} samples", other.times.len()),
            });
        }
        Ok(())
    }

    /// Equal-weight mean of TFRs sharing frequencies and times, over the
    /// channels every input has. Channels missing from any input are dropped.
    pub fn grand_average(items: &[AverageTfr]) -> AnalysisResult<AverageTfr> {
        let common = common_channels(items.iter().map(|t| t.ch_names.as_slice()));
        if items.is_empty() || common.is_empty() {
            return Err(AnalysisError::EmptySelection("no TFR channels shared by every input".into()));
        }
        let picked = items
            .iter()
            .map(|item| {
                if item.ch_names.len() != common.len() {
                    let dropped: Vec<&str> = item
                        .ch_names
                        .iter()
                        .filter(|c| !common.contains(c))
                        .map(String::as_str)
                        .collect();
                    warn!("grand average drops {:?} from {}", dropped, item.comment);
                }
                item.pick(common.as_slice())
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        let first = &picked[0];
        let mut sum = Array3::<f64>::zeros(first.data.raw_dim());
        for item in &picked {
            first.same_grid(item)?;
            sum += &item.data;
        }
        Ok(AverageTfr {
            data: sum / items.len() as f64,
            ch_names: common,
            freqs: first.freqs.clone(),
            times: first.times.clone(),
            nave: items.len(),
            comment: format!("Grand average (n = {})", items.len()),
        })
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write TFR to {}", path.display()))
    }

    pub fn load_json(path: &Path) -> anyhow::Result<AverageTfr> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse TFR from {}", path.display()))
    }
}
