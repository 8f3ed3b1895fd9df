//! FastICA artifact removal.
//!
//! The decomposition is fitted on a filtered, resampled copy of the good EEG
//! channels. Mixing and unmixing matrices are then used on the original
//! recording to project excluded sources out of those channels.
use crate::error::{AnalysisError, AnalysisResult};
use crate::metrics::quality::excess_kurtosis;
use crate::signal::Raw;
use anyhow::Context;
use linfa::prelude::*;
use linfa_ica::fast_ica::FastIca;
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Volts are fitted in µV so the normal equations stay well scaled.
const FIT_SCALE: f64 = 1e6;
/// Relative eigenvalue floor for the rank estimate (1e-4 on singular values).
const RANK_TOL: f64 = 1e-8;
const JACOBI_SWEEPS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaParams {
    pub n_components: usize,
    pub max_iter: usize,
    pub tol: f64,
    /// Rate of the fitting copy; `None` keeps the recording rate.
    pub resample_sfreq: Option<f64>,
    pub l_freq: f64,
    pub h_freq: f64,
}

impl Default for IcaParams {
    fn default() -> Self {
        Self {
            n_components: 30,
            max_iter: 200,
            tol: 1e-4,
            resample_sfreq: Some(200.0),
            l_freq: 1.0,
            h_freq: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub index: usize,
    pub kurtosis: f64,
    /// Share of the fitted data variance carried by the back-projected source.
    pub variance_explained: f64,
}

/// A fitted decomposition of `ch_names`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ica {
    pub ch_names: Vec<String>,
    /// `[channel, component]`, µV per source unit.
    pub mixing: Array2<f64>,
    /// `[component, channel]`.
    pub unmixing: Array2<f64>,
    pub components: Vec<ComponentSummary>,
    pub exclude: Vec<usize>,
    pub n_samples_fit: usize,
}

/// Gauss-Jordan inverse with partial pivoting.
fn invert_matrix(matrix: &Array2<f64>) -> AnalysisResult<Array2<f64>> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(AnalysisError::Ica("matrix must be square".into()));
    }
    let scale = matrix.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = matrix[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }
    for i in 0..n {
        let mut max_row = i;
        for k in (i + 1)..n {
            if aug[[k, i]].abs() > aug[[max_row, i]].abs() {
                max_row = k;
            }
        }
        if max_row != i {
            for j in 0..(2 * n) {
                aug.swap([i, j], [max_row, j]);
            }
        }
        let pivot = aug[[i, i]];
        if pivot.abs() < 1e-12 * scale {
            return Err(AnalysisError::Ica("matrix is singular or nearly singular".into()));
        }
        for j in 0..(2 * n) {
            aug[[i, j]] /= pivot;
        }
        for k in 0..n {
            if k != i {
                let factor = aug[[k, i]];
                if factor != 0.0 {
                    for j in 0..(2 * n) {
                        aug[[k, j]] -= factor * aug[[i, j]];
                    }
                }
            }
        }
    }
    Ok(aug.slice(ndarray::s![.., n..]).to_owned())
}

/// Eigenvalues of a symmetric matrix by cyclic Jacobi rotations, largest first.
fn symmetric_eigenvalues(matrix: &Array2<f64>) -> Vec<f64> {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let total: f64 = a.iter().map(|v| v * v).sum();
    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[[p, q]] * a[[p, q]])
            .sum();
        if off <= f64::EPSILON * f64::EPSILON * total {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
            }
        }
    }
    let mut values: Vec<f64> = a.diag().to_vec();
    values.sort_by(|x, y| y.total_cmp(x));
    values
}

/// Number of covariance eigenvalues above `RANK_TOL` times the largest.
/// An average reference removes one dimension, a bridged pair another.
fn estimate_rank(centred: &Array2<f64>) -> usize {
    let n_samples = centred.nrows().max(1) as f64;
    let cov = centred.t().dot(centred) / n_samples;
    let values = symmetric_eigenvalues(&cov);
    let largest = values.first().copied().unwrap_or(0.0);
    if largest <= 0.0 {
        return 0;
    }
    values.iter().filter(|v| **v > largest * RANK_TOL).count()
}

/// `A = Xᵀ S (SᵀS)⁻¹` and its pseudo-inverse `W = (AᵀA)⁻¹ Aᵀ`.
fn mixing_unmixing(data: &Array2<f64>, sources: &Array2<f64>) -> AnalysisResult<(Array2<f64>, Array2<f64>)> {
    let sts_inv = invert_matrix(&sources.t().dot(sources))?;
    let mixing = data.t().dot(sources).dot(&sts_inv);
    let ata_inv = invert_matrix(&mixing.t().dot(&mixing))?;
    let unmixing = ata_inv.dot(&mixing.t());
    Ok((mixing, unmixing))
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    if saa == 0.0 || sbb == 0.0 {
        0.0
    } else {
        sab / (saa * sbb).sqrt()
    }
}

/// Fit FastICA on the good EEG channels of `raw`.
pub fn fit_ica(raw: &Raw, params: &IcaParams) -> AnalysisResult<Ica> {
    let picks = raw.good_eeg_indices();
    if picks.len() < 2 {
        return Err(AnalysisError::EmptySelection(format!(
            "ICA needs at least two good EEG channels, found {}",
            picks.len()
        )));
    }
    let ch_names: Vec<String> = picks.iter().map(|&i| raw.ch_names[i].clone()).collect();
    let mut copy = raw.pick(ch_names.as_slice())?;
    copy.filter(Some(params.l_freq), Some(params.h_freq))?;
    if let Some(target) = params.resample_sfreq {
        if target < copy.sfreq {
            copy.resample(target)?;
        }
    }
    let n_samples = copy.n_times();
    let n_channels = ch_names.len();
    let mut data_matrix =
        Array2::from_shape_fn((n_samples, n_channels), |(i, j)| copy.data[[j, i]] * FIT_SCALE);
    let mean = data_matrix
        .mean_axis(Axis(0))
        .ok_or_else(|| AnalysisError::EmptySelection("no samples to fit".into()))?;
    data_matrix -= &mean;

    let rank = estimate_rank(&data_matrix);
    if rank < 2 {
        return Err(AnalysisError::Ica(format!(
            "data rank {} is too low to unmix {} channels",
            rank, n_channels
        )));
    }
    if rank < n_channels {
        info!("data rank {} for {} channels", rank, n_channels);
    }
    let n_components = params.n_components.min(rank);
    if n_components < params.n_components {
        warn!(
            "n_components capped at {} (rank of the good EEG channels)",
            n_components
        );
    }
    let total_variance: f64 = data_matrix
        .axis_iter(Axis(1))
        .map(|col| col.iter().map(|x| x * x).sum::<f64>() / n_samples as f64)
        .sum();

    info!(
        "fitting FastICA: {} components on {} channels x {} samples at {} Hz",
        n_components,
        ch_names.len(),
        n_samples,
        copy.sfreq
    );
    let dataset = DatasetBase::from(data_matrix.clone());
    let model = FastIca::params()
        .ncomponents(n_components)
        .max_iter(params.max_iter)
        .tol(params.tol)
        .fit(&dataset)
        .map_err(|e| AnalysisError::Ica(format!("{:?}", e)))?;
    let sources: Array2<f64> = model.predict(&data_matrix);
    let (mixing, unmixing) = mixing_unmixing(&data_matrix, &sources)?;

    let components: Vec<ComponentSummary> = (0..n_components)
        .map(|i| {
            let series = sources.column(i).to_vec();
            let source_var = series.iter().map(|x| x * x).sum::<f64>() / n_samples as f64;
            let weight: f64 = mixing.column(i).iter().map(|a| a * a).sum();
            ComponentSummary {
                index: i,
                kurtosis: excess_kurtosis(&series),
                variance_explained: if total_variance > 0.0 {
                    100.0 * weight * source_var / total_variance
                } else {
                    0.0
                },
            }
        })
        .collect();
    debug!("ICA components: {:?}", components);
    Ok(Ica {
        ch_names,
        mixing,
        unmixing,
        components,
        exclude: Vec::new(),
        n_samples_fit: n_samples,
    })
}

impl Ica {
    pub fn n_components(&self) -> usize {
        self.mixing.ncols()
    }

    fn raw_indices(&self, raw: &Raw) -> AnalysisResult<Vec<usize>> {
        self.ch_names.iter().map(|n| raw.channel_index(n)).collect()
    }

    /// Fitted channels of `raw` in µV with each row's mean removed, `[channel, sample]`.
    fn centred(&self, raw: &Raw) -> AnalysisResult<Array2<f64>> {
        let idx = self.raw_indices(raw)?;
        let mut x = raw.data.select(Axis(0), &idx).mapv(|v| v * FIT_SCALE);
        for mut row in x.axis_iter_mut(Axis(0)) {
            let m = row.mean().unwrap_or(0.0);
            row -= m;
        }
        Ok(x)
    }

    /// Source time courses of `raw`, `[component, sample]`.
    pub fn sources(&self, raw: &Raw) -> AnalysisResult<Array2<f64>> {
        Ok(self.unmixing.dot(&self.centred(raw)?))
    }

    /// Mark components for removal. Out-of-range indices are errors.
    pub fn set_exclude(&mut self, exclude: &[usize]) -> AnalysisResult<()> {
        if let Some(bad) = exclude.iter().find(|&&c| c >= self.n_components()) {
            return Err(AnalysisError::InvalidParameter(format!(
                "component {} out of range (0..{})",
                bad,
                self.n_components()
            )));
        }
        let mut ex = exclude.to_vec();
        ex.sort_unstable();
        ex.dedup();
        self.exclude = ex;
        Ok(())
    }

    /// Remove the excluded sources from the fitted channels of `raw`.
    pub fn apply(&self, raw: &mut Raw) -> AnalysisResult<()> {
        if self.exclude.is_empty() {
            info!("ICA apply: no components excluded");
            return Ok(());
        }
        let idx = self.raw_indices(raw)?;
        let sources = self.sources(raw)?;
        let a = self.mixing.select(Axis(1), &self.exclude);
        let s = sources.select(Axis(0), &self.exclude);
        let artifact = a.dot(&s);
        for (row, &ch) in idx.iter().enumerate() {
            let mut target = raw.data.row_mut(ch);
            target
                .iter_mut()
                .zip(artifact.row(row))
                .for_each(|(v, art)| *v -= art / FIT_SCALE);
        }
        info!("ICA apply: removed components {:?}", self.exclude);
        Ok(())
    }

    /// Absolute correlation of every source with the named channel.
    pub fn channel_scores(&self, raw: &Raw, channel: &str) -> AnalysisResult<Vec<f64>> {
        let reference = raw.data.row(raw.channel_index(channel)?).to_vec();
        let sources = self.sources(raw)?;
        Ok(sources
            .axis_iter(Axis(0))
            .map(|s| pearson(&s.to_vec(), &reference).abs())
            .collect())
    }

    /// Components whose score is more than `z_threshold` standard deviations
    /// above the mean score.
    pub fn find_outlier_components(scores: &[f64], z_threshold: f64) -> Vec<usize> {
        let n = scores.len() as f64;
        if scores.len() < 2 {
            return Vec::new();
        }
        let mean = scores.iter().sum::<f64>() / n;
        let sd = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
        if sd == 0.0 {
            return Vec::new();
        }
        scores
            .iter()
            .enumerate()
            .filter(|(_, s)| (**s - mean) / sd > z_threshold)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)
            .with_context(|| format!("failed to write ICA to {}", path.display()))
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Ica> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse ICA from {}", path.display()))
    }
}
