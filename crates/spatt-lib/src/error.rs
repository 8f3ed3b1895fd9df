use thiserror::Error;

/// Domain failures raised by the numeric and data-model layers.
///
/// Readers and writers keep returning `anyhow::Result` with file context;
/// these variants cover the cases where the data itself is inconsistent.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("condition '{0}' not present in epochs")]
    UnknownCondition(String),
    #[error("{what} do not match ({left} vs {right})")]
    GridMismatch {
        what: &'static str,
        left: String,
        right: String,
    },
    #[error("selection is empty: {0}")]
    EmptySelection(String),
    #[error("invalid window [{tmin}, {tmax}]")]
    InvalidWindow { tmin: f64, tmax: f64 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("denominator is zero at channel {channel}, freq index {freq}, time index {time}")]
    ZeroDenominator {
        channel: usize,
        freq: usize,
        time: usize,
    },
    #[error("wavelet at {freq} Hz spans {wavelet} samples but epochs only have {signal}")]
    WaveletTooLong {
        freq: f64,
        wavelet: usize,
        signal: usize,
    },
    #[error("repeated events at sample {0}")]
    RepeatedEvent(usize),
    #[error("ICA failed: {0}")]
    Ica(String),
    #[error("FFT failed: {0}")]
    Fft(String),
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;
