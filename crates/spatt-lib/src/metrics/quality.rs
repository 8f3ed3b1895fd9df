use crate::signal::Raw;
use serde::{Deserialize, Serialize};

/// Per-channel summary shown during the first look at a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub name: String,
    pub std: f64,
    pub kurtosis: f64,
    /// Robust z-score of `std` across the good EEG channels.
    pub std_z: f64,
}

impl ChannelQuality {
    /// Flat or unusually noisy channel.
    pub fn is_suspect(&self, z_limit: f64) -> bool {
        self.std <= f64::EPSILON || self.std_z.abs() > z_limit
    }
}

/// Excess kurtosis (`m4 / m2² - 3`); zero for constant input.
pub fn excess_kurtosis(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let m2 = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    if m2 == 0.0 {
        return 0.0;
    }
    let m4 = data.iter().map(|x| (x - mean).powi(4)).sum::<f64>() / n;
    m4 / (m2 * m2) - 3.0
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Standard deviation, kurtosis and a median/MAD z-score of the standard
/// deviation for every good EEG channel.
pub fn channel_quality(raw: &Raw) -> Vec<ChannelQuality> {
    let picks = raw.good_eeg_indices();
    let stats: Vec<(f64, f64)> = picks
        .iter()
        .map(|&c| {
            let row = raw.data.row(c).to_vec();
            let n = row.len().max(1) as f64;
            let mean = row.iter().sum::<f64>() / n;
            let std = (row.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
            (std, excess_kurtosis(&row))
        })
        .collect();
    let stds: Vec<f64> = stats.iter().map(|(s, _)| *s).collect();
    let med = median(&stds);
    let deviations: Vec<f64> = stds.iter().map(|s| (s - med).abs()).collect();
    let mad = median(&deviations) * 1.4826;
    picks
        .iter()
        .zip(stats)
        .map(|(&c, (std, kurtosis))| ChannelQuality {
            name: raw.ch_names[c].clone(),
            std,
            kurtosis,
            std_z: if mad > 0.0 { (std - med) / mad } else { 0.0 },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn kurtosis_of_constant_is_zero() {
        assert_eq!(excess_kurtosis(&[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn spiky_signal_has_positive_kurtosis() {
        let mut data = vec![0.0; 100];
        data[50] = 10.0;
        assert!(excess_kurtosis(&data) > 10.0);
    }

    #[test]
    fn flat_and_noisy_channels_are_suspect() {
        let names: Vec<String> = ["Fz", "Cz", "Pz", "Oz", "FT10"].iter().map(|s| s.to_string()).collect();
        let data = Array2::from_shape_fn((5, 400), |(c, t)| {
            let gain = match c {
                0 => 0.0,
                4 => 50.0,
                _ => 1.0 + 0.05 * c as f64,
            };
            gain * 1e-5 * (t as f64 * 0.3).sin()
        });
        let raw = Raw::new(names, 100.0, data).unwrap();
        let quality = channel_quality(&raw);
        let suspect: Vec<&str> = quality
            .iter()
            .filter(|q| q.is_suspect(5.0))
            .map(|q| q.name.as_str())
            .collect();
        assert_eq!(suspect, vec!["Fz", "FT10"]);
    }
}
