use assert_cmd::cargo::cargo_bin_cmd;
use spatt_lib::report::{ItemMeta, Report};
use std::{error::Error, fs, path::PathBuf};

#[test]
fn config_check_accepts_the_study_fixture() {
    let config = workspace_root().join("test_data/study.toml");
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["config-check", "--config", config.to_str().expect("utf8 path")]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let stdout = String::from_utf8(output).expect("utf8 stdout");
    assert!(stdout.contains("STN-in-PD: ok"), "unexpected output: {}", stdout);
    assert!(stdout.contains("2 subjects"));
}

#[test]
fn config_check_reports_inconsistent_settings() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.toml");
    fs::write(
        &path,
        r#"
project = "broken"
task = "SpAtt"
default_platform = "nowhere"

[event_mapping]
1 = "cue_onset_right"

[epoching]
tmin = 1.0
tmax = -0.5

[epoching.conditions]
cue = ["cue_onset_right", "cue_onset_left"]

[subjects.7]
stim_segments = [10.0]
"#,
    )?;
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["config-check", "--config", path.to_str().expect("utf8 path")]);
    let output = cmd.assert().failure().get_output().stderr.clone();
    let stderr = String::from_utf8(output)?;
    assert!(stderr.contains("default_platform 'nowhere'"));
    assert!(stderr.contains("cue_onset_left"));
    assert!(stderr.contains("stim_segments"));
    Ok(())
}

#[test]
fn config_check_fails_on_missing_file() {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["config-check", "--config", "/nonexistent/study.toml"]);
    cmd.assert().failure();
}

#[test]
fn report_html_exports_saved_report() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let json = dir.path().join("sub-107_report.json");
    let mut report = Report::new("Subject 107");
    report.add_table(
        &["channel", "status"],
        vec![vec!["FT10".into(), "bad".into()]],
        ItemMeta::new("Channel quality").section("raw"),
    );
    report.save(&json)?;

    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["report-html", "--input", json.to_str().expect("utf8 path")]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let written = PathBuf::from(String::from_utf8(output)?.trim());
    assert_eq!(written, json.with_extension("html"));

    let html = fs::read_to_string(&written)?;
    assert!(html.contains("<title>Subject 107</title>"));
    assert!(html.contains("<td>FT10</td>"));
    Ok(())
}

#[test]
fn report_html_requires_existing_report() {
    let mut cmd = cargo_bin_cmd!("spatt");
    cmd.args(["report-html", "--input", "/nonexistent/report.json"]);
    cmd.assert().failure();
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
