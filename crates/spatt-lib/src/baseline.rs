use crate::error::{AnalysisError, AnalysisResult};
use serde::{Deserialize, Serialize};

/// How a baseline interval rescales the data it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BaselineMode {
    /// Subtract the baseline mean.
    #[default]
    Mean,
    /// Divide by the baseline mean.
    Ratio,
    /// `log10` of the ratio.
    Logratio,
    /// Relative change, `(x - m) / m`.
    Percent,
    /// Subtract the mean and divide by the baseline standard deviation.
    Zscore,
}

impl std::str::FromStr for BaselineMode {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "ratio" => Ok(Self::Ratio),
            "logratio" => Ok(Self::Logratio),
            "percent" => Ok(Self::Percent),
            "zscore" => Ok(Self::Zscore),
            other => Err(AnalysisError::InvalidParameter(format!(
                "unknown baseline mode '{}'",
                other
            ))),
        }
    }
}

/// Indices of `times` inside `[tmin, tmax]`; open ends extend to the data edges.
pub fn baseline_indices(
    times: &[f64],
    tmin: Option<f64>,
    tmax: Option<f64>,
) -> AnalysisResult<std::ops::Range<usize>> {
    let lo = tmin.unwrap_or(f64::NEG_INFINITY);
    let hi = tmax.unwrap_or(f64::INFINITY);
    if lo > hi {
        return Err(AnalysisError::InvalidWindow { tmin: lo, tmax: hi });
    }
    let tol = 1e-9;
    let start = times.iter().position(|t| *t >= lo - tol);
    let stop = times.iter().rposition(|t| *t <= hi + tol);
    match (start, stop) {
        (Some(a), Some(b)) if a <= b => Ok(a..b + 1),
        _ => Err(AnalysisError::EmptySelection(format!(
            "no samples in baseline [{}, {}]",
            lo, hi
        ))),
    }
}

/// Rescale one trace in place using the samples in `range` as reference.
pub fn rescale(trace: &mut [f64], range: std::ops::Range<usize>, mode: BaselineMode) {
    let base = &trace[range];
    let n = base.len() as f64;
    let mean = base.iter().sum::<f64>() / n;
    let std = (base.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    for v in trace.iter_mut() {
        *v = match mode {
            BaselineMode::Mean => *v - mean,
            BaselineMode::Ratio => *v / mean,
            BaselineMode::Logratio => (*v / mean).log10(),
            BaselineMode::Percent => (*v - mean) / mean,
            BaselineMode::Zscore => (*v - mean) / std,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_change_relative_to_baseline() {
        let times = [-0.2, -0.1, 0.0, 0.1];
        let range = baseline_indices(&times, Some(-0.2), Some(-0.1)).unwrap();
        assert_eq!(range, 0..2);
        let mut trace = [2.0, 2.0, 3.0, 1.0];
        rescale(&mut trace, range, BaselineMode::Percent);
        assert_eq!(trace, [0.0, 0.0, 0.5, -0.5]);
    }

    #[test]
    fn open_ended_baseline_runs_to_edges() {
        let times = [-0.2, -0.1, 0.0, 0.1];
        assert_eq!(baseline_indices(&times, None, Some(0.0)).unwrap(), 0..3);
        assert_eq!(baseline_indices(&times, Some(0.0), None).unwrap(), 2..4);
    }

    #[test]
    fn empty_baseline_is_an_error() {
        let times = [0.0, 0.1];
        assert!(baseline_indices(&times, Some(-0.5), Some(-0.3)).is_err());
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!("logratio".parse::<BaselineMode>().unwrap(), BaselineMode::Logratio);
        assert!("db".parse::<BaselineMode>().is_err());
    }
}
