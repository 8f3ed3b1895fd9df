//! BIDS sidecar tables: `events.tsv` and `channels.tsv`.
use crate::annotations::{Annotation, Annotations, Event, EventId};
use crate::signal::{ChannelKind, Raw};
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::path::Path;

/// One row of a BIDS `events.tsv`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BidsEvent {
    pub onset: f64,
    pub duration: Option<f64>,
    pub trial_type: Option<String>,
    pub value: Option<i32>,
    pub sample: Option<usize>,
}

fn column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header.eq_ignore_ascii_case(name))
}

impl BidsEvent {
    fn from_record(record: &StringRecord, cols: &EventColumns) -> Result<Self> {
        let onset = record
            .get(cols.onset)
            .ok_or_else(|| anyhow!("missing onset column"))?
            .parse::<f64>()
            .context("parsing onset")?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty() && *v != "n/a")
        };
        Ok(Self {
            onset,
            duration: field(cols.duration).and_then(|v| v.parse().ok()),
            trial_type: field(cols.trial_type).map(|v| v.to_string()),
            value: field(cols.value).and_then(|v| v.parse().ok()),
            sample: field(cols.sample).and_then(|v| v.parse().ok()),
        })
    }
}

struct EventColumns {
    onset: usize,
    duration: Option<usize>,
    trial_type: Option<usize>,
    value: Option<usize>,
    sample: Option<usize>,
}

/// Load BIDS `events.tsv` into structured rows.
pub fn read_bids_events(path: &Path) -> Result<Vec<BidsEvent>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let cols = EventColumns {
        onset: column(&headers, "onset")
            .ok_or_else(|| anyhow!("events.tsv must include an onset column"))?,
        duration: column(&headers, "duration"),
        trial_type: column(&headers, "trial_type"),
        value: column(&headers, "value"),
        sample: column(&headers, "sample"),
    };
    let mut out = Vec::new();
    for result in reader.records() {
        let record = result.context("reading events record")?;
        out.push(BidsEvent::from_record(&record, &cols)?);
    }
    Ok(out)
}

/// Annotations from `events.tsv` rows; rows without `trial_type` use their value.
pub fn bids_events_to_annotations(events: &[BidsEvent]) -> Annotations {
    Annotations::new(
        events
            .iter()
            .filter_map(|e| {
                let label = e
                    .trial_type
                    .clone()
                    .or_else(|| e.value.map(|v| v.to_string()))?;
                Some(Annotation::new(e.onset, e.duration.unwrap_or(0.0), &label))
            })
            .collect(),
    )
}

/// Write events as `events.tsv`. Onsets are seconds from the first retained sample.
pub fn write_bids_events(path: &Path, events: &[Event], event_id: &EventId, sfreq: f64) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["onset", "duration", "trial_type", "value", "sample"])?;
    for e in events {
        let label = event_id
            .iter()
            .find(|(_, code)| **code == e.code)
            .map(|(label, _)| label.as_str())
            .unwrap_or("n/a");
        writer.write_record([
            format!("{:.6}", e.sample as f64 / sfreq),
            "0.0".to_string(),
            label.to_string(),
            e.code.to_string(),
            e.sample.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn kind_label(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Eeg => "EEG",
        ChannelKind::Eog => "EOG",
        ChannelKind::Lfp => "LFP",
        ChannelKind::Misc => "MISC",
        ChannelKind::Stim => "TRIG",
    }
}

fn parse_kind(label: &str) -> Option<ChannelKind> {
    match label.to_ascii_uppercase().as_str() {
        "EEG" => Some(ChannelKind::Eeg),
        "EOG" | "VEOG" | "HEOG" => Some(ChannelKind::Eog),
        "LFP" | "SEEG" | "DBS" => Some(ChannelKind::Lfp),
        "MISC" => Some(ChannelKind::Misc),
        "TRIG" | "STIM" => Some(ChannelKind::Stim),
        _ => None,
    }
}

/// Write `channels.tsv` with kinds and good/bad status.
pub fn write_channels(path: &Path, raw: &Raw) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["name", "type", "units", "status"])?;
    for (name, kind) in raw.ch_names.iter().zip(&raw.ch_kinds) {
        let status = if raw.is_bad(name) { "bad" } else { "good" };
        writer.write_record([name.as_str(), kind_label(*kind), "V", status])?;
    }
    writer.flush()?;
    Ok(())
}

/// Apply a `channels.tsv` sidecar: channel kinds and bad status.
pub fn apply_channels(path: &Path, raw: &mut Raw) -> Result<()> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let name_idx = column(&headers, "name").ok_or_else(|| anyhow!("channels.tsv needs a name column"))?;
    let type_idx = column(&headers, "type");
    let status_idx = column(&headers, "status");
    for result in reader.records() {
        let record = result.context("reading channels record")?;
        let name = record.get(name_idx).unwrap_or_default().trim().to_string();
        if let Some(kind) = type_idx.and_then(|i| record.get(i)).and_then(parse_kind) {
            raw.set_kind(&name, kind)
                .with_context(|| format!("{} lists an unknown channel", path.display()))?;
        }
        if status_idx.and_then(|i| record.get(i)).map(str::trim) == Some("bad") {
            raw.mark_bads(&[name.as_str()])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .expect("workspace root")
            .to_path_buf()
    }

    #[test]
    fn parses_bids_events_file() {
        let events = read_bids_events(&workspace_root().join("test_data/bids_events.tsv")).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].onset, 1.5);
        assert_eq!(events[1].trial_type.as_deref(), Some("cue_onset_left"));
        assert_eq!(events[3].value, Some(20));
        assert_eq!(events[3].duration, None);
    }

    #[test]
    fn rows_become_annotations() {
        let events = read_bids_events(&workspace_root().join("test_data/bids_events.tsv")).unwrap();
        let anns = bids_events_to_annotations(&events);
        assert_eq!(anns.counts().get("cue_onset_right"), Some(&2));
    }

    #[test]
    fn channels_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.tsv");
        let mut raw = Raw::new(
            vec!["Fp1".into(), "VEOG".into(), "FT10".into()],
            100.0,
            Array2::zeros((3, 10)),
        )
        .unwrap();
        raw.mark_bads(&["FT10"]).unwrap();
        write_channels(&path, &raw).unwrap();

        let mut fresh = Raw::new(raw.ch_names.clone(), 100.0, Array2::zeros((3, 10))).unwrap();
        fresh.ch_kinds = vec![ChannelKind::Misc; 3];
        apply_channels(&path, &mut fresh).unwrap();
        assert_eq!(fresh.bads, vec!["FT10"]);
        assert_eq!(fresh.ch_kinds[1], ChannelKind::Eog);
    }
}
