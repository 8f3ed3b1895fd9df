use crate::signal::Raw;
use anyhow::{anyhow, Result};
use edf_reader::file_reader::SyncFileReader;
use edf_reader::sync_reader::SyncEDFReader;
use log::{info, warn};
use ndarray::Array2;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Helper implementing the EDF reader trait for on-disk files.
struct DiskFileReader {
    path: PathBuf,
}

impl DiskFileReader {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SyncFileReader for DiskFileReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Volts per physical unit for the dimensions EDF writers commonly use.
fn unit_scale(dimension: &str) -> f64 {
    match dimension.trim() {
        "uV" | "µV" | "μV" => 1e-6,
        "mV" => 1e-3,
        "nV" => 1e-9,
        _ => 1.0,
    }
}

/// Load every signal channel of an EDF file.
///
/// All channels must share one rate. `sfreq_override` replaces the header
/// rate without touching the samples; exports from the stimulation device are
/// known to carry a header rate that disagrees with the logger.
pub fn read_edf(path: &Path, sfreq_override: Option<f64>) -> Result<Raw> {
    let reader = SyncEDFReader::init_with_file_reader(DiskFileReader::new(path))
        .map_err(|e| anyhow!("failed to open EDF {}: {}", path.display(), e))?;
    let header = &reader.edf_header;
    let total_duration = header.block_duration * header.number_of_blocks;
    let data_matrix = reader
        .read_data_window(0, total_duration)
        .map_err(|e| anyhow!("failed to read EDF data from {}: {}", path.display(), e))?;

    let mut names = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut sfreq: Option<f64> = None;
    for (idx, chan) in header.channels.iter().enumerate() {
        let label = chan.label.trim().to_string();
        if label == "EDF Annotations" {
            continue;
        }
        let fs = chan.number_of_samples_in_data_record as f64 * 1000.0
            / header.block_duration as f64;
        match sfreq {
            None => sfreq = Some(fs),
            Some(expected) if (expected - fs).abs() > 1e-9 => {
                return Err(anyhow!(
                    "channel {} is sampled at {} Hz but earlier channels use {} Hz",
                    label,
                    fs,
                    expected
                ));
            }
            Some(_) => {}
        }
        let samples = data_matrix
            .get(idx)
            .ok_or_else(|| anyhow!("missing data for channel {}", label))?;
        let scale = unit_scale(&chan.physical_dimension);
        rows.push(samples.iter().map(|v| *v as f64 * scale).collect());
        names.push(label);
    }
    let header_sfreq = sfreq.ok_or_else(|| anyhow!("{} has no signal channels", path.display()))?;
    let sfreq = match sfreq_override {
        Some(forced) => {
            warn!(
                "{}: header rate {} Hz overridden with {} Hz",
                path.display(),
                header_sfreq,
                forced
            );
            forced
        }
        None => header_sfreq,
    };
    let n_times = rows.iter().map(|r| r.len()).min().unwrap_or(0);
    let data = Array2::from_shape_fn((rows.len(), n_times), |(c, t)| rows[c][t]);
    let raw = Raw::new(names, sfreq, data)?;
    info!(
        "read {}: {} channels, {} samples at {} Hz",
        path.display(),
        raw.n_channels(),
        raw.n_times(),
        raw.sfreq
    );
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_dimensions_scale_to_volts() {
        assert_eq!(unit_scale("uV"), 1e-6);
        assert_eq!(unit_scale(" mV "), 1e-3);
        assert_eq!(unit_scale("V"), 1.0);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = read_edf(Path::new("/nonexistent/sub-01.edf"), None).unwrap_err();
        assert!(err.to_string().contains("sub-01.edf"));
    }
}
