use assert_cmd::cargo::cargo_bin_cmd;
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use spatt_lib::{
    annotations::{Annotation, Annotations},
    bids::BidsPath,
    epochs::{Epochs, Evoked},
    ica::Ica,
    io::{read_raw, write_raw},
    report::Report,
    signal::Raw,
    tfr::AverageTfr,
};
use std::{error::Error, f64::consts::PI, fs, path::Path};

const SFREQ: f64 = 250.0;
const DURATION: f64 = 120.0;
const CHANNELS: [&str; 6] = ["PO3", "POz", "PO4", "Oz", "Cz", "VEOG"];

/// Cue onsets every 2.5 s, alternating right (S1) and left (S2).
fn cue_times() -> Vec<(f64, i32)> {
    (0..46)
        .map(|k| (2.0 + 2.5 * k as f64, if k % 2 == 0 { 1 } else { 2 }))
        .collect()
}

fn synthetic_recording(seed: u64) -> Result<Raw, Box<dyn Error>> {
    let n = (DURATION * SFREQ) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let sources: Vec<Box<dyn Fn(f64) -> f64>> = vec![
        Box::new(|t| (2.0 * PI * 10.0 * t).sin()),
        Box::new(|t| (2.0 * PI * 3.0 * t).sin().signum()),
        Box::new(|t| 2.0 * (7.0 * t).fract() - 1.0),
        Box::new(|t| (2.0 * PI * 17.0 * t + 0.3 * (2.0 * PI * 0.5 * t).sin()).sin()),
        Box::new(|t| (2.0 * PI * 23.3 * t).sin() * (2.0 * PI * 1.1 * t).sin()),
    ];
    let mixing = [
        [1.0, 0.3, 0.1, 0.2, 0.1],
        [0.8, 0.1, 0.4, 0.1, 0.3],
        [1.2, 0.2, 0.1, 0.5, 0.2],
        [0.9, 0.5, 0.3, 0.1, 0.4],
        [0.2, 0.9, 0.6, 0.7, 0.8],
    ];
    let blink = |t: f64| {
        let phase = t % 4.0 - 2.0;
        (-(phase * phase) / (2.0 * 0.05 * 0.05)).exp()
    };
    let mut data = Array2::zeros((CHANNELS.len(), n));
    for i in 0..n {
        let t = i as f64 / SFREQ;
        let values: Vec<f64> = sources.iter().map(|s| s(t)).collect();
        for (ch, weights) in mixing.iter().enumerate() {
            let mixed: f64 = weights.iter().zip(&values).map(|(w, v)| w * v).sum();
            data[[ch, i]] = (mixed * 10.0 + rng.gen_range(-0.5..0.5)) * 1e-6;
        }
        data[[5, i]] = (blink(t) * 150.0 + rng.gen_range(-1.0..1.0)) * 1e-6;
    }
    let names = CHANNELS.iter().map(|s| s.to_string()).collect();
    let mut raw = Raw::new(names, SFREQ, data)?;
    raw.annotations = Annotations::new(
        cue_times()
            .into_iter()
            .map(|(t, code)| Annotation::new(t, 0.0, &format!("Stimulus/S  {}", code)))
            .collect(),
    );
    Ok(raw)
}

fn study_config(root: &Path) -> String {
    format!(
        r#"
project = "synthetic"
task = "SpAtt"
default_platform = "local"

[platforms.local]
bids_root = '{bids}'
data_root = '{data}'
report_root = '{reports}'

[event_mapping]
1 = "cue_onset_right"
2 = "cue_onset_left"

[epoching]
tmin = -0.5
tmax = 1.5
l_freq = 1.0
h_freq = 40.0

[epoching.conditions]
cue = ["cue_onset_right", "cue_onset_left"]

[ica]
max_iter = 1000
tol = 1e-3

[subjects.01]
no_stim_segments = [0.0, 58.0]
stim_segments = [60.0, 118.0]

[subjects.02]
no_stim_segments = [0.0, 58.0]
stim_segments = [60.0, 118.0]
"#,
        bids = root.join("bids").display(),
        data = root.join("data").display(),
        reports = root.join("reports").display(),
    )
}

fn run_stage(config: &Path, subject: &str, args: &[&str]) {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(args)
        .args(["--config", config.to_str().expect("utf8 path")])
        .args(["--subject", subject, "--yes"]);
    cmd.assert().success();
}

fn run_group(config: &Path, command: &str) {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args([
        command,
        "--config",
        config.to_str().expect("utf8 path"),
        "--subjects",
        "01,02",
    ]);
    cmd.assert().success();
}

#[test]
fn subject_pipeline_runs_from_raw_to_group_report() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let config = root.join("study.toml");
    fs::write(&config, study_config(root))?;
    for (subject, seed) in [("01", 7), ("02", 11)] {
        let recording = root.join(format!("data/{}_SpAtt.vhdr", subject));
        write_raw(&synthetic_recording(seed)?, &recording)?;
        let mut first_look = vec!["first-look", "--input", recording.to_str().expect("utf8 path")];
        if subject == "01" {
            first_look.extend(["--bads", "Cz"]);
        }
        run_stage(&config, subject, &first_look);
    }

    let bids = BidsPath::new(root.join("bids"), "01", "SpAtt");
    let first = read_raw(&bids.file("eeg", "vhdr"), None)?;
    assert_eq!(first.bads, vec!["Cz".to_string()]);
    let labels: Vec<&str> = first.annotations.iter().map(|a| a.description.as_str()).collect();
    assert_eq!(labels.iter().filter(|l| **l == "cue_onset_right").count(), 23);
    assert_eq!(labels.iter().filter(|l| **l == "cue_onset_left").count(), 23);
    let events = fs::read_to_string(bids.file("events", "tsv"))?;
    assert_eq!(events.lines().count(), 47);
    let eve = fs::read_to_string(bids.derivative(&["eve"], "txt"))?;
    assert_eq!(eve.lines().count(), 46);
    assert!(eve.starts_with("500 0 1\n"));

    for subject in ["01", "02"] {
        for stage in ["annotate", "ica", "segment-stim", "epoch", "erp", "tfr-mi"] {
            run_stage(&config, subject, &[stage]);
        }
    }

    assert!(bids.derivative(&["ann", "eeg"], "vhdr").exists());
    // average reference leaves rank 3 on the four good EEG channels
    let ica = Ica::load_json(&bids.derivative(&["ica"], "json"))?;
    assert_eq!(ica.ch_names, vec!["PO3", "POz", "PO4", "Oz"]);
    assert_eq!(ica.components.len(), 3);
    let stim = read_raw(&bids.derivative(&["stim", "ica", "eeg"], "vhdr"), None)?;
    assert!((stim.duration() - 58.0).abs() < 0.01);
    let epochs = Epochs::load_json(&bids.derivative(&["no-stim", "epo-cue"], "json"))?;
    assert!(!epochs.is_empty());
    let right = epochs.select(&["cue_onset_right"])?.len();
    let left = epochs.select(&["cue_onset_left"])?.len();
    assert_eq!(right, left);
    assert!(bids.derivative(&["stim", "evo-cue"], "json").exists());
    for segment in ["no-stim", "stim"] {
        let both = AverageTfr::load_json(&bids.derivative(&[segment, "tfr-both"], "json"))?;
        assert!(!both.ch_names.contains(&"Cz".to_string()));
        assert!(bids.derivative(&[segment, "paf"], "json").exists());
        let mi = fs::read_to_string(bids.derivative(&[segment, "mi"], "csv"))?;
        assert!(mi.lines().count() > 1);
    }
    let other = BidsPath::new(root.join("bids"), "02", "SpAtt");
    let both = AverageTfr::load_json(&other.derivative(&["stim", "tfr-both"], "json"))?;
    assert!(both.ch_names.contains(&"Cz".to_string()));

    run_group(&config, "group-tfr");
    let group = root.join("bids/derivatives/group");
    let grand = AverageTfr::load_json(&group.join("group_task-SpAtt_stim_tfr-both.json"))?;
    assert_eq!(grand.ch_names, vec!["PO3", "POz", "PO4", "Oz"]);
    assert_eq!(grand.nave, 2);
    let mi = fs::read_to_string(group.join("group_task-SpAtt_no-stim_mi.csv"))?;
    assert!(mi.lines().count() > 1);

    run_group(&config, "group-erp");
    let evoked = Evoked::load_json(&group.join("group_task-SpAtt_stim_evo-cue.json"))?;
    assert!(!evoked.ch_names.contains(&"Cz".to_string()));
    assert!(evoked.ch_names.contains(&"PO3".to_string()));
    let pooled = Epochs::load_json(&group.join("group_task-SpAtt_no-stim_epo-cue.json"))?;
    assert_eq!(pooled.ch_names, vec!["PO3", "PO4", "Oz", "POz"]);
    assert!(pooled.len() > epochs.len());

    let group_report = Report::open_or_create(&root.join("reports/group/group_report.json"), "unused")?;
    assert!(group_report
        .items
        .iter()
        .any(|item| item.tags.contains(&"stim".to_string()) && item.title.contains("difference")));
    assert!(group_report
        .items
        .iter()
        .any(|item| item.title == "Group evoked responses, stim vs no stim"));

    let subject_report = Report::open_or_create(&bids.report(&root.join("reports"), "json"), "unused")?;
    assert_eq!(subject_report.title, "Subject 01");
    let sections: Vec<&str> = subject_report
        .items
        .iter()
        .filter_map(|item| item.section.as_deref())
        .collect();
    for wanted in ["raw", "annotations", "ica", "stim", "epochs", "tfr", "alpha"] {
        assert!(sections.contains(&wanted), "missing report section {}", wanted);
    }
    Ok(())
}

#[test]
fn first_look_takes_events_from_a_sidecar_file() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    let recording = root.join("data/01_SpAtt.vhdr");
    write_raw(&synthetic_recording(7)?, &recording)?;
    let config = root.join("study.toml");
    fs::write(&config, study_config(root))?;
    let sidecar = root.join("events.tsv");
    fs::write(
        &sidecar,
        "onset\tduration\ttrial_type\tvalue\n10.0\t0\tcue\t2\n20.0\tn/a\tcue\t1\n30.0\t0\tbreak\tn/a\n",
    )?;

    run_stage(
        &config,
        "01",
        &[
            "first-look",
            "--input",
            recording.to_str().expect("utf8 path"),
            "--events",
            sidecar.to_str().expect("utf8 path"),
        ],
    );
    let bids = BidsPath::new(root.join("bids"), "01", "SpAtt");
    let eve = fs::read_to_string(bids.derivative(&["eve"], "txt"))?;
    assert_eq!(eve, "2500 0 2\n5000 0 1\n");
    let first = read_raw(&bids.file("eeg", "vhdr"), None)?;
    let counts = first.annotations.counts();
    assert_eq!(counts.get("cue_onset_left"), Some(&1));
    assert_eq!(counts.get("cue_onset_right"), Some(&1));
    Ok(())
}
