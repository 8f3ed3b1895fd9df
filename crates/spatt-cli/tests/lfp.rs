use assert_cmd::cargo::cargo_bin_cmd;
use serde::Deserialize;
use spatt_lib::{io::read_raw, report::Report};
use std::{collections::BTreeMap, error::Error, path::PathBuf};

#[derive(Deserialize)]
struct LfpSummary {
    samples: usize,
    sfreq: f64,
    duration_s: f64,
    tags: BTreeMap<i32, usize>,
}

fn logger_export() -> String {
    workspace_root()
        .join("test_data/lfp_logger.csv")
        .to_str()
        .expect("utf8 path")
        .to_string()
}

#[test]
fn lfp_inspect_summarises_logger_export() -> Result<(), Box<dyn Error>> {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["lfp-inspect", "--input", &logger_export(), "--sfreq", "1250"]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: LfpSummary = serde_json::from_slice(&output)?;

    assert_eq!(summary.samples, 10);
    assert_eq!(summary.sfreq, 1250.0);
    assert!((summary.duration_s - 0.008).abs() < 1e-12);
    assert_eq!(summary.tags.get(&1), Some(&2));
    assert_eq!(summary.tags.get(&4), Some(&1));
    assert_eq!(summary.tags.len(), 2);
    Ok(())
}

#[test]
fn lfp_inspect_writes_recording_and_report() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let vhdr = dir.path().join("lfp/sub-107_lfp.vhdr");
    let report = dir.path().join("reports/lfp.json");

    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args([
        "lfp-inspect",
        "--input",
        &logger_export(),
        "--sfreq",
        "1250",
        "--channel",
        "STN_R",
        "--out",
        vhdr.to_str().expect("utf8 path"),
        "--report",
        report.to_str().expect("utf8 path"),
    ]);
    cmd.assert().success();

    let raw = read_raw(&vhdr, None)?;
    assert_eq!(raw.ch_names, vec!["STN_R".to_string()]);
    assert_eq!(raw.n_times(), 10);
    assert_eq!(raw.sfreq, 1250.0);

    let saved = Report::open_or_create(&report, "unused")?;
    assert_eq!(saved.title, "LFP inspection");
    assert!(saved.items.iter().any(|item| item.title.ends_with("tag histogram")));
    Ok(())
}

#[test]
fn lfp_inspect_requires_sampling_rate() {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["lfp-inspect", "--input", &logger_export()]);
    cmd.assert().failure();
}

#[test]
fn lfp_inspect_takes_sampling_rate_from_subject_config() -> Result<(), Box<dyn Error>> {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["lfp-inspect", "--input", &logger_export()])
        .args(["--config", &study_config(), "--subject", "107"]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: LfpSummary = serde_json::from_slice(&output)?;

    assert_eq!(summary.sfreq, 1250.0);
    assert!((summary.duration_s - 0.008).abs() < 1e-12);
    Ok(())
}

#[test]
fn lfp_inspect_fails_for_subject_without_lfp_rate() {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["lfp-inspect", "--input", &logger_export()])
        .args(["--config", &study_config(), "--subject", "101"]);
    cmd.assert().failure();
}

fn study_config() -> String {
    workspace_root()
        .join("test_data/study.toml")
        .to_str()
        .expect("utf8 path")
        .to_string()
}

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .expect("crates dir")
        .parent()
        .expect("workspace root")
        .to_path_buf()
}
