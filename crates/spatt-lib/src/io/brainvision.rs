//! BrainVision `.vhdr/.vmrk/.eeg` triplets.
//!
//! Sample data is decoded by `bvreader`; markers are parsed here because the
//! reader only covers the header and the binary payload. Written files use
//! multiplexed IEEE_FLOAT_32 samples in µV.
use crate::annotations::{Annotation, Annotations};
use crate::signal::Raw;
use anyhow::{anyhow, Context, Result};
use bvreader::bv_reader::BVFile;
use log::{debug, info};
use ndarray::Array2;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const VOLTS_PER_MICROVOLT: f64 = 1e-6;

/// Read a BrainVision recording. Marker positions become annotations.
pub fn read_brainvision(vhdr: &Path) -> Result<Raw> {
    let path_str = vhdr
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", vhdr.display()))?;
    let mut file = BVFile::from_header(path_str)
        .map_err(|e| anyhow!("failed to load BrainVision file {}: {:?}", vhdr.display(), e))?;
    file.validate()
        .map_err(|e| anyhow!("invalid BrainVision file {}: {:?}", vhdr.display(), e))?;
    file.bv_data
        .scale_channels(&file.bv_header.channel_info)
        .map_err(|e| anyhow!("failed to scale channels in {}: {:?}", vhdr.display(), e))?;

    let sfreq = 1_000_000.0 / file.bv_header.sampling_interval as f64;
    let ch_names: Vec<String> = file
        .bv_header
        .channel_info
        .iter()
        .map(|ch| ch.label.replace("\\1", ","))
        .collect();
    let n_times = file.bv_data.data.first().map(|c| c.len()).unwrap_or(0);
    if file.bv_data.data.len() != ch_names.len() {
        return Err(anyhow!(
            "{} lists {} channels but the data holds {}",
            vhdr.display(),
            ch_names.len(),
            file.bv_data.data.len()
        ));
    }
    let mut data = Array2::zeros((ch_names.len(), n_times));
    for (ch, samples) in file.bv_data.data.iter().enumerate() {
        if samples.len() != n_times {
            return Err(anyhow!("channel {} has {} samples, expected {}", ch, samples.len(), n_times));
        }
        for (t, &v) in samples.iter().enumerate() {
            data[[ch, t]] = v as f64 * VOLTS_PER_MICROVOLT;
        }
    }
    let mut raw = Raw::new(ch_names, sfreq, data)?;

    let header_text = fs::read_to_string(vhdr)
        .with_context(|| format!("failed to read {}", vhdr.display()))?;
    if let Some(marker_name) = common_info(&header_text, "MarkerFile") {
        let vmrk = sibling(vhdr, &marker_name);
        if vmrk.exists() {
            raw.annotations = read_markers(&vmrk, sfreq)?;
        } else {
            log::warn!("marker file {} is missing; no annotations loaded", vmrk.display());
        }
    }
    info!(
        "read {}: {} channels, {} samples at {} Hz, {} annotations",
        vhdr.display(),
        raw.n_channels(),
        raw.n_times(),
        sfreq,
        raw.annotations.len()
    );
    Ok(raw)
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.parent()
        .map(|dir| dir.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Value of `key` in the `[Common Infos]` section.
fn common_info(text: &str, key: &str) -> Option<String> {
    let mut in_common = false;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_common = line.eq_ignore_ascii_case("[Common Infos]");
            continue;
        }
        if !in_common || line.starts_with(';') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim().eq_ignore_ascii_case(key) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Read a `.vmrk` marker file into annotations.
pub fn read_markers(vmrk: &Path, sfreq: f64) -> Result<Annotations> {
    let text = fs::read_to_string(vmrk)
        .with_context(|| format!("failed to read {}", vmrk.display()))?;
    parse_markers(&text, sfreq).with_context(|| format!("parsing {}", vmrk.display()))
}

/// Parse `Mk<n>=<type>,<description>,<position>,<size>,<channel>` lines.
/// Positions are 1-based samples; `New Segment` markers are skipped and
/// `Comment` markers keep only their description.
pub fn parse_markers(text: &str, sfreq: f64) -> Result<Annotations> {
    let mut in_markers = false;
    let mut items = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('[') {
            in_markers = line.eq_ignore_ascii_case("[Marker Infos]");
            continue;
        }
        if !in_markers || line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !key.trim().starts_with("Mk") {
            continue;
        }
        let fields: Vec<&str> = value.split(',').collect();
        if fields.len() < 4 {
            return Err(anyhow!("line {}: malformed marker '{}'", idx + 1, line));
        }
        let kind = fields[0].replace("\\1", ",");
        if kind == "New Segment" {
            continue;
        }
        let description = fields[1].replace("\\1", ",");
        let position: usize = fields[2]
            .trim()
            .parse()
            .with_context(|| format!("line {}: bad marker position '{}'", idx + 1, fields[2]))?;
        let size: usize = fields[3].trim().parse().unwrap_or(1);
        let onset = position.saturating_sub(1) as f64 / sfreq;
        let duration = if size > 1 { size as f64 / sfreq } else { 0.0 };
        // free-text labels are stored as comments by the writer
        let label = if description.is_empty() {
            kind
        } else if kind == "Comment" {
            description
        } else {
            format!("{}/{}", kind, description)
        };
        items.push(Annotation::new(onset, duration, &label));
    }
    debug!("parsed {} markers", items.len());
    Ok(Annotations::new(items))
}

/// Write `raw` as a BrainVision triplet next to `vhdr`. Annotation onsets are
/// stored relative to the first retained sample.
pub fn write_brainvision(raw: &Raw, vhdr: &Path) -> Result<()> {
    let stem = vhdr
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("invalid header path {}", vhdr.display()))?;
    if let Some(dir) = vhdr.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }
    let eeg_name = format!("{}.eeg", stem);
    let vmrk_name = format!("{}.vmrk", stem);

    let mut header = String::new();
    header.push_str("Brain Vision Data Exchange Header File Version 1.0\n");
    header.push_str("; Data written by spatt\n\n");
    header.push_str("[Common Infos]\nCodepage=UTF-8\n");
    header.push_str(&format!("DataFile={}\nMarkerFile={}\n", eeg_name, vmrk_name));
    header.push_str("DataFormat=BINARY\nDataOrientation=MULTIPLEXED\n");
    header.push_str(&format!("NumberOfChannels={}\n", raw.n_channels()));
    header.push_str(&format!("SamplingInterval={}\n\n", 1_000_000.0 / raw.sfreq));
    header.push_str("[Binary Infos]\nBinaryFormat=IEEE_FLOAT_32\n\n");
    header.push_str("[Channel Infos]\n");
    for (i, name) in raw.ch_names.iter().enumerate() {
        header.push_str(&format!("Ch{}={},,1,µV\n", i + 1, name.replace(',', "\\1")));
    }
    fs::write(vhdr, header).with_context(|| format!("failed to write {}", vhdr.display()))?;

    let eeg_path = sibling(vhdr, &eeg_name);
    let file = File::create(&eeg_path)
        .with_context(|| format!("failed to create {}", eeg_path.display()))?;
    let mut writer = BufWriter::new(file);
    for t in 0..raw.n_times() {
        for ch in 0..raw.n_channels() {
            let value = (raw.data[[ch, t]] / VOLTS_PER_MICROVOLT) as f32;
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    writer.flush()?;

    let vmrk_path = sibling(vhdr, &vmrk_name);
    fs::write(&vmrk_path, format_markers(raw, &eeg_name))
        .with_context(|| format!("failed to write {}", vmrk_path.display()))?;
    info!("wrote {} ({} channels, {} samples)", vhdr.display(), raw.n_channels(), raw.n_times());
    Ok(())
}

fn format_markers(raw: &Raw, eeg_name: &str) -> String {
    let mut out = String::new();
    out.push_str("Brain Vision Data Exchange Marker File, Version 1.0\n\n");
    out.push_str(&format!("[Common Infos]\nCodepage=UTF-8\nDataFile={}\n\n", eeg_name));
    out.push_str("[Marker Infos]\nMk1=New Segment,,1,1,0\n");
    let mut mk = 2;
    for ann in raw.annotations.iter() {
        let offset = ann.onset - raw.first_time;
        if offset < 0.0 {
            continue;
        }
        let position = (offset * raw.sfreq).round() as usize + 1;
        let size = ((ann.duration * raw.sfreq).round() as usize).max(1);
        let (kind, description) = match ann.description.split_once('/') {
            Some((k, d)) => (k.to_string(), d.to_string()),
            None => ("Comment".to_string(), ann.description.clone()),
        };
        out.push_str(&format!(
            "Mk{}={},{},{},{},0\n",
            mk,
            kind.replace(',', "\\1"),
            description.replace(',', "\\1"),
            position,
            size
        ));
        mk += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKERS: &str = "Brain Vision Data Exchange Marker File, Version 1.0\n\n\
[Common Infos]\nCodepage=UTF-8\nDataFile=x.eeg\n\n\
[Marker Infos]\n\
; Each entry: Mk<Marker number>=<Type>,<Description>,<Position in data points>\n\
Mk1=New Segment,,1,1,0,20230101120000000000\n\
Mk2=Stimulus,S  1,501,1,0\n\
Mk3=Stimulus,S 20,1001,1,0\n\
Mk4=Comment,BAD_manual,1501,250,0\n";

    #[test]
    fn markers_become_annotations() {
        let anns = parse_markers(MARKERS, 500.0).unwrap();
        let items: Vec<_> = anns.iter().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].description, "Stimulus/S  1");
        assert!((items[0].onset - 1.0).abs() < 1e-12);
        assert_eq!(items[2].description, "BAD_manual");
        assert!((items[2].duration - 0.5).abs() < 1e-12);
    }

    #[test]
    fn common_info_lookup() {
        let text = "Brain Vision Data Exchange Header File Version 1.0\n[Common Infos]\nDataFile=a.eeg\nMarkerFile=a.vmrk\n[Binary Infos]\nMarkerFile=nope\n";
        assert_eq!(common_info(text, "MarkerFile").as_deref(), Some("a.vmrk"));
        assert_eq!(common_info(text, "SamplingInterval"), None);
    }

    #[test]
    fn writer_emits_header_and_markers() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array2::from_shape_fn((2, 100), |(c, t)| (c as f64 + 1.0) * t as f64 * 1e-6);
        let mut raw = Raw::new(vec!["Cz".into(), "VEOG".into()], 250.0, data).unwrap();
        raw.annotations.push(Annotation::new(0.2, 0.0, "Stimulus/S  2"));
        raw.annotations.push(Annotation::new(0.1, 0.0, "cue_onset_left"));
        let vhdr = dir.path().join("sub-01_task-SpAtt_eeg.vhdr");
        write_brainvision(&raw, &vhdr).unwrap();

        let header = fs::read_to_string(&vhdr).unwrap();
        assert!(header.contains("SamplingInterval=4000"));
        assert!(header.contains("Ch2=VEOG,,1,µV"));
        let eeg = fs::read(dir.path().join("sub-01_task-SpAtt_eeg.eeg")).unwrap();
        assert_eq!(eeg.len(), 2 * 100 * 4);
        let markers = read_markers(&dir.path().join("sub-01_task-SpAtt_eeg.vmrk"), 250.0).unwrap();
        let descriptions: Vec<_> = markers.iter().map(|a| a.description.clone()).collect();
        assert_eq!(descriptions, vec!["cue_onset_left", "Stimulus/S  2"]);
    }
}
