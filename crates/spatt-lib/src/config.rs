//! Study configuration loaded from TOML.
//!
//! Holds every per-study and per-subject constant of the analysis: platform
//! roots, the trigger code mapping, epoching/TFR/alpha settings and the
//! subject tables with bad channels, ICA exclusions and crop times.
use crate::annotations::{BreakParams, EventLabels};
use crate::baseline::BaselineMode;
use crate::detectors::eog::EogConfig;
use crate::epochs::{EpochParams, RepeatedPolicy};
use crate::error::{AnalysisError, AnalysisResult};
use crate::ica::IcaParams;
use crate::metrics::alpha::AlphaParams;
use crate::reject::ThresholdParams;
use crate::tfr::TfrParams;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PLATFORM_ENV: &str = "SPATT_PLATFORM";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub bids_root: PathBuf,
    pub data_root: PathBuf,
    pub report_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochingConfig {
    pub tmin: f64,
    pub tmax: f64,
    pub detrend: Option<u8>,
    /// Band-pass applied to the recording before epoching.
    pub l_freq: Option<f64>,
    pub h_freq: Option<f64>,
    pub event_repeated: RepeatedPolicy,
    /// Epoching type → labels, e.g. `cue = ["cue_onset_right", "cue_onset_left"]`.
    pub conditions: BTreeMap<String, Vec<String>>,
}

impl Default for EpochingConfig {
    fn default() -> Self {
        let mut conditions = BTreeMap::new();
        conditions.insert(
            "cue".to_string(),
            vec!["cue_onset_right".to_string(), "cue_onset_left".to_string()],
        );
        Self {
            tmin: -0.5,
            tmax: 1.5,
            detrend: Some(1),
            l_freq: Some(0.1),
            h_freq: Some(100.0),
            event_repeated: RepeatedPolicy::Merge,
            conditions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TfrConfig {
    pub fmin: f64,
    pub fmax: f64,
    pub fstep: f64,
    pub time_bandwidth: f64,
    pub decim: usize,
    pub baseline: [f64; 2],
    pub mode: BaselineMode,
}

impl Default for TfrConfig {
    fn default() -> Self {
        Self {
            fmin: 2.0,
            fmax: 30.0,
            fstep: 1.0,
            time_bandwidth: 2.0,
            decim: 2,
            baseline: [-0.3, -0.1],
            mode: BaselineMode::Percent,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    pub bads: Vec<String>,
    pub ica_exclude: Vec<usize>,
    /// Seconds dropped from the start of the recording.
    pub crop_tmin: Option<f64>,
    pub eog_channel: Option<String>,
    pub eog_threshold: Option<f64>,
    /// `[start, stop]` or `[start, stop, start, stop]` in seconds.
    pub stim_segments: Vec<f64>,
    pub no_stim_segments: Vec<f64>,
    /// Recordings concatenated for this subject, relative to `data_root`.
    pub brainvision_files: Vec<PathBuf>,
    pub lfp_sfreq: Option<f64>,
    /// Replaces the study-wide mapping for this subject.
    pub event_mapping: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    pub project: String,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub default_platform: Option<String>,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
    /// Trigger code (as a string key) → label.
    #[serde(default)]
    pub event_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub epoching: EpochingConfig,
    #[serde(default)]
    pub tfr: TfrConfig,
    #[serde(default)]
    pub alpha: AlphaParams,
    #[serde(default)]
    pub ica: IcaParams,
    #[serde(default)]
    pub reject: ThresholdParams,
    #[serde(default)]
    pub breaks: BreakParams,
    #[serde(default)]
    pub eog: EogConfig,
    /// Occipital sensors shown in group evoked comparisons.
    #[serde(default = "default_erp_channels")]
    pub erp_channels: Vec<String>,
    #[serde(default)]
    pub subjects: BTreeMap<String, SubjectConfig>,
}

fn default_task() -> String {
    "SpAtt".to_string()
}

fn default_erp_channels() -> Vec<String> {
    ["O1", "PO3", "O2", "PO4", "Oz", "POz"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// Split a flat `[start, stop, ...]` list into pairs.
pub fn segment_pairs(flat: &[f64]) -> AnalysisResult<Vec<(f64, f64)>> {
    if flat.len() % 2 != 0 {
        return Err(AnalysisError::InvalidParameter(format!(
            "segment list needs start/stop pairs, got {} values",
            flat.len()
        )));
    }
    let pairs: Vec<(f64, f64)> = flat.chunks(2).map(|c| (c[0], c[1])).collect();
    for (start, stop) in &pairs {
        if stop <= start || *start < 0.0 {
            return Err(AnalysisError::InvalidWindow {
                tmin: *start,
                tmax: *stop,
            });
        }
    }
    Ok(pairs)
}

fn parse_mapping(mapping: &BTreeMap<String, String>) -> AnalysisResult<EventLabels> {
    mapping
        .iter()
        .map(|(code, label)| {
            code.trim()
                .parse::<i32>()
                .map(|c| (c, label.clone()))
                .map_err(|_| AnalysisError::InvalidParameter(format!("event code '{}' is not an integer", code)))
        })
        .collect()
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<StudyConfig> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: StudyConfig =
            toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))?;
        debug!(
            "loaded {} ({} subjects, {} platforms)",
            path.display(),
            config.subjects.len(),
            config.platforms.len()
        );
        Ok(config)
    }

    /// Settings for `subject`; an unknown subject gets empty defaults.
    pub fn subject(&self, subject: &str) -> SubjectConfig {
        match self.subjects.get(subject) {
            Some(cfg) => cfg.clone(),
            None => {
                warn!("subject {} has no entry in the config, using defaults", subject);
                SubjectConfig::default()
            }
        }
    }

    /// Platform roots: explicit name, then `SPATT_PLATFORM`, then `default_platform`.
    pub fn platform(&self, name: Option<&str>) -> Result<&PlatformConfig> {
        let from_env = std::env::var(PLATFORM_ENV).ok();
        let chosen = name
            .map(str::to_string)
            .or(from_env)
            .or_else(|| self.default_platform.clone())
            .ok_or_else(|| anyhow!("no platform given and no default_platform in the config"))?;
        self.platforms
            .get(&chosen)
            .ok_or_else(|| anyhow!("platform '{}' is not defined in the config", chosen))
    }

    /// Code → label mapping for `subject`, honouring a per-subject override.
    /// Sampling rate of the subject's LFP logger exports. There is no
    /// study-wide fallback: the devices export at either 1000 or 1250 Hz.
    pub fn lfp_sfreq(&self, subject: &str) -> AnalysisResult<f64> {
        self.subjects
            .get(subject)
            .and_then(|s| s.lfp_sfreq)
            .ok_or_else(|| {
                AnalysisError::InvalidParameter(format!(
                    "subject {} has no lfp_sfreq; set it in the config or pass --sfreq",
                    subject
                ))
            })
    }

    pub fn event_labels(&self, subject: &str) -> AnalysisResult<EventLabels> {
        let override_map = self.subjects.get(subject).and_then(|s| s.event_mapping.as_ref());
        parse_mapping(override_map.unwrap_or(&self.event_mapping))
    }

    pub fn epoch_params(&self) -> EpochParams {
        EpochParams {
            tmin: self.epoching.tmin,
            tmax: self.epoching.tmax,
            detrend: self.epoching.detrend,
            baseline: None,
            reject_by_annotation: true,
            event_repeated: self.epoching.event_repeated,
        }
    }

    pub fn tfr_params(&self) -> AnalysisResult<TfrParams> {
        let mut params = TfrParams::linear(self.tfr.fmin, self.tfr.fmax, self.tfr.fstep)?;
        params.time_bandwidth = self.tfr.time_bandwidth;
        params.decim = self.tfr.decim;
        Ok(params)
    }

    pub fn conditions(&self, epoching_type: &str) -> AnalysisResult<&[String]> {
        self.epoching
            .conditions
            .get(epoching_type)
            .map(Vec::as_slice)
            .ok_or_else(|| AnalysisError::UnknownCondition(epoching_type.to_string()))
    }

    /// Every problem found in the configuration; empty when it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(default) = &self.default_platform {
            if !self.platforms.contains_key(default) {
                problems.push(format!("default_platform '{}' is not defined", default));
            }
        }
        if self.epoching.tmax <= self.epoching.tmin {
            problems.push(format!(
                "epoching window [{}, {}] is empty",
                self.epoching.tmin, self.epoching.tmax
            ));
        }
        if let Err(e) = self.tfr_params() {
            problems.push(format!("tfr: {}", e));
        }
        if self.tfr.decim == 0 {
            problems.push("tfr.decim must be at least 1".into());
        }
        if self.tfr.baseline[1] < self.tfr.baseline[0] {
            problems.push("tfr.baseline is reversed".into());
        }
        if self.alpha.channels.is_empty() {
            problems.push("alpha.channels is empty".into());
        }
        if self.alpha.fmax <= self.alpha.fmin || self.alpha.tmax <= self.alpha.tmin {
            problems.push("alpha band or window is empty".into());
        }
        if self.alpha.epsilon < 0.0 {
            problems.push("alpha.epsilon must not be negative".into());
        }
        match parse_mapping(&self.event_mapping) {
            Ok(labels) => {
                for (kind, wanted) in &self.epoching.conditions {
                    for label in wanted {
                        if !labels.values().any(|l| l == label) {
                            problems.push(format!(
                                "condition '{}' of '{}' is not in event_mapping",
                                label, kind
                            ));
                        }
                    }
                }
            }
            Err(e) => problems.push(e.to_string()),
        }
        for (id, subject) in &self.subjects {
            for (what, flat) in [
                ("stim_segments", &subject.stim_segments),
                ("no_stim_segments", &subject.no_stim_segments),
            ] {
                if let Err(e) = segment_pairs(flat) {
                    problems.push(format!("subject {}: {}: {}", id, what, e));
                }
            }
            if let Some(mapping) = &subject.event_mapping {
                if let Err(e) = parse_mapping(mapping) {
                    problems.push(format!("subject {}: {}", id, e));
                }
            }
            if let Some(rate) = subject.lfp_sfreq {
                if rate <= 0.0 {
                    problems.push(format!("subject {}: lfp_sfreq must be positive", id));
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
project = "DBS-SpAtt"
default_platform = "mac"

[platforms.mac]
bids_root = "/Volumes/jenseno-avtemporal-attention/bids"
data_root = "/Volumes/jenseno-avtemporal-attention/raw"
report_root = "/Volumes/jenseno-avtemporal-attention/reports"

[platforms.bluebear]
bids_root = "/rds/projects/spatt/bids"
data_root = "/rds/projects/spatt/raw"
report_root = "/rds/projects/spatt/reports"

[event_mapping]
1 = "cue_onset_right"
2 = "cue_onset_left"
3 = "trial_onset"

[tfr]
decim = 4

[alpha]
fmin = 6.0
epsilon = 1e-10
peak_source = "condition_mean"

[subjects.107]
bads = ["FT10", "T7"]
ica_exclude = [0, 4]
crop_tmin = 12.5
stim_segments = [10.0, 300.0, 420.0, 700.0]
no_stim_segments = [800.0, 1200.0]
lfp_sfreq = 1250.0

[subjects.108.event_mapping]
11 = "cue_onset_right"
12 = "cue_onset_left"
"#;

    #[test]
    fn parses_study_file_with_defaults() {
        let cfg: StudyConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.task, "SpAtt");
        assert_eq!(cfg.tfr.decim, 4);
        assert_eq!(cfg.tfr.fmax, 30.0);
        assert_eq!(cfg.alpha.fmin, 6.0);
        assert_eq!(cfg.alpha.channels, vec!["PO4", "POz", "PO3"]);
        assert_eq!(cfg.alpha.peak_source, crate::metrics::alpha::PeakSource::ConditionMean);
        assert_eq!(cfg.ica.n_components, 30);
        let s = cfg.subject("107");
        assert_eq!(s.bads, vec!["FT10", "T7"]);
        assert_eq!(s.lfp_sfreq, Some(1250.0));
        assert_eq!(cfg.lfp_sfreq("107").unwrap(), 1250.0);
        assert!(matches!(cfg.lfp_sfreq("108"), Err(AnalysisError::InvalidParameter(_))));
        assert!(cfg.lfp_sfreq("999").is_err());
        assert_eq!(cfg.erp_channels, vec!["O1", "PO3", "O2", "PO4", "Oz", "POz"]);
        assert_eq!(
            segment_pairs(&s.stim_segments).unwrap(),
            vec![(10.0, 300.0), (420.0, 700.0)]
        );
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn subject_mapping_overrides_study_mapping() {
        let cfg: StudyConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.event_labels("107").unwrap().get(&3).map(String::as_str), Some("trial_onset"));
        let labels = cfg.event_labels("108").unwrap();
        assert_eq!(labels.get(&11).map(String::as_str), Some("cue_onset_right"));
        assert!(!labels.contains_key(&1));
    }

    #[test]
    fn platform_flag_wins_over_default() {
        let cfg: StudyConfig = toml::from_str(SAMPLE).unwrap();
        let bb = cfg.platform(Some("bluebear")).unwrap();
        assert_eq!(bb.bids_root, PathBuf::from("/rds/projects/spatt/bids"));
        assert!(cfg.platform(Some("laptop")).is_err());
    }

    #[test]
    fn validation_reports_problems() {
        let mut cfg: StudyConfig = toml::from_str(SAMPLE).unwrap();
        cfg.event_mapping.insert("x1".into(), "oops".into());
        cfg.epoching.tmax = -1.0;
        cfg.subjects.get_mut("107").unwrap().no_stim_segments = vec![5.0];
        let problems = cfg.validate();
        assert_eq!(problems.len(), 3, "{:?}", problems);
    }

    #[test]
    fn odd_segment_lists_are_rejected() {
        assert!(segment_pairs(&[1.0, 2.0, 3.0]).is_err());
        assert!(segment_pairs(&[5.0, 2.0]).is_err());
        assert!(segment_pairs(&[]).unwrap().is_empty());
    }
}
