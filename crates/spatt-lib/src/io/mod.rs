pub mod brainvision;
pub mod edf;
pub mod lfp;
pub mod text;
pub mod tsv;

use crate::signal::Raw;
use anyhow::{anyhow, Result};
use log::debug;
use std::path::{Path, PathBuf};

/// `channels.tsv` sidecar that belongs to a recording written by this crate.
pub fn channels_sidecar(recording: &Path) -> PathBuf {
    let stem = recording
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let base = stem
        .rsplit_once('_')
        .map(|(head, _)| head)
        .unwrap_or(stem);
    recording.with_file_name(format!("{}_channels.tsv", base))
}

/// Read a recording by extension (`.vhdr` or `.edf`) and apply its
/// `channels.tsv` sidecar when present.
pub fn read_raw(path: &Path, sfreq_override: Option<f64>) -> Result<Raw> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let mut raw = match ext.as_str() {
        "vhdr" => brainvision::read_brainvision(path)?,
        "edf" => edf::read_edf(path, sfreq_override)?,
        other => return Err(anyhow!("unsupported recording format '.{}' ({})", other, path.display())),
    };
    let sidecar = channels_sidecar(path);
    if sidecar.exists() {
        debug!("applying {}", sidecar.display());
        tsv::apply_channels(&sidecar, &mut raw)?;
    }
    Ok(raw)
}

/// Write a BrainVision derivative and its `channels.tsv`.
pub fn write_raw(raw: &Raw, vhdr: &Path) -> Result<()> {
    brainvision::write_brainvision(raw, vhdr)?;
    tsv::write_channels(&channels_sidecar(vhdr), raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_replaces_suffix() {
        let p = Path::new("/d/sub-01_ses-01_task-SpAtt_run-01_eeg.vhdr");
        assert_eq!(
            channels_sidecar(p),
            PathBuf::from("/d/sub-01_ses-01_task-SpAtt_run-01_channels.tsv")
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(read_raw(Path::new("recording.fif"), None).is_err());
    }
}
