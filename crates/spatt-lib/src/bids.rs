//! BIDS file naming for raw data and derivatives.
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsPath {
    pub root: PathBuf,
    pub subject: String,
    pub session: Option<String>,
    pub task: String,
    pub run: Option<String>,
    pub datatype: String,
}

impl BidsPath {
    pub fn new(root: impl Into<PathBuf>, subject: &str, task: &str) -> Self {
        Self {
            root: root.into(),
            subject: subject.to_string(),
            session: None,
            task: task.to_string(),
            run: None,
            datatype: "eeg".to_string(),
        }
    }

    pub fn with_session(mut self, session: Option<&str>) -> Self {
        self.session = session.map(str::to_string);
        self
    }

    pub fn with_run(mut self, run: Option<&str>) -> Self {
        self.run = run.map(str::to_string);
        self
    }

    /// `sub-<s>[_ses-<x>]_task-<t>[_run-<r>]`
    pub fn basename(&self) -> String {
        let mut name = format!("sub-{}", self.subject);
        if let Some(ses) = &self.session {
            name.push_str(&format!("_ses-{}", ses));
        }
        name.push_str(&format!("_task-{}", self.task));
        if let Some(run) = &self.run {
            name.push_str(&format!("_run-{}", run));
        }
        name
    }

    /// `<root>/sub-<s>[/ses-<x>]/<datatype>`
    pub fn datatype_dir(&self) -> PathBuf {
        let mut dir = self.root.join(format!("sub-{}", self.subject));
        if let Some(ses) = &self.session {
            dir = dir.join(format!("ses-{}", ses));
        }
        dir.join(&self.datatype)
    }

    /// Raw-data file such as `..._eeg.vhdr` or `..._events.tsv`.
    pub fn file(&self, suffix: &str, extension: &str) -> PathBuf {
        self.datatype_dir()
            .join(format!("{}_{}.{}", self.basename(), suffix, extension))
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.root
            .join("derivatives")
            .join(format!("sub-{}", self.subject))
    }

    /// `<root>/derivatives/sub-<s>/<basename>_<part>_<part>.<ext>`
    pub fn derivative<S: AsRef<str>>(&self, parts: &[S], extension: &str) -> PathBuf {
        let mut name = self.basename();
        for part in parts {
            name.push('_');
            name.push_str(part.as_ref());
        }
        self.derivatives_dir().join(format!("{}.{}", name, extension))
    }

    /// Report document for this recording under `report_root`.
    pub fn report(&self, report_root: &Path, extension: &str) -> PathBuf {
        report_root
            .join(format!("sub-{}", self.subject))
            .join(format!("{}_report.{}", self.basename(), extension))
    }
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_includes_optional_entities() {
        let path = BidsPath::new("/bids", "107", "SpAtt");
        assert_eq!(path.basename(), "sub-107_task-SpAtt");
        let path = path.with_session(Some("01")).with_run(Some("02"));
        assert_eq!(path.basename(), "sub-107_ses-01_task-SpAtt_run-02");
    }

    #[test]
    fn raw_and_derivative_locations() {
        let path = BidsPath::new("/bids", "107", "SpAtt").with_session(Some("01"));
        assert_eq!(
            path.file("eeg", "vhdr"),
            PathBuf::from("/bids/sub-107/ses-01/eeg/sub-107_ses-01_task-SpAtt_eeg.vhdr")
        );
        assert_eq!(
            path.derivative(&["ann", "eeg"], "vhdr"),
            PathBuf::from("/bids/derivatives/sub-107/sub-107_ses-01_task-SpAtt_ann_eeg.vhdr")
        );
        assert_eq!(
            path.report(Path::new("/reports"), "json"),
            PathBuf::from("/reports/sub-107/sub-107_ses-01_task-SpAtt_report.json")
        );
    }

    #[test]
    fn ensure_parent_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c.json");
        ensure_parent(&target).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
