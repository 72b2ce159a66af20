//! Run artifacts: JSON reports written under the artifact directory.
//!
//! The directory is listed in `.git/info/exclude` so artifacts never show up
//! as working-tree changes. `.gitignore` is left alone since editing it would
//! itself be a change the executor has to commit or roll back.

use crate::exec::checkpoint;
use crate::model::{DiagnosisReport, ManualGuidance, RepairResult};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DIAGNOSIS_REPORT_FILE: &str = "diagnosis-report.json";
pub const REPAIR_RESULT_FILE: &str = "repair-result.json";
pub const MANUAL_GUIDANCE_FILE: &str = "manual-guidance.json";

pub struct ArtifactStore {
    repo_root: PathBuf,
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(repo_root: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and keep it out of `git status`.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        self.ensure_ignored()
    }

    fn ensure_ignored(&self) -> Result<()> {
        let Ok(relative) = self.dir.strip_prefix(&self.repo_root) else {
            // Outside the work tree; nothing to hide.
            return Ok(());
        };
        let Ok(git_dir) = checkpoint::git_dir(&self.repo_root) else {
            return Ok(());
        };
        let entry = format!("/{}/", relative.to_string_lossy().trim_end_matches('/'));
        let exclude = git_dir.join("info").join("exclude");
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        append_ignore_entry(&exclude, &entry)
    }

    pub fn write_report(&self, report: &DiagnosisReport) -> Result<PathBuf> {
        self.write_json(DIAGNOSIS_REPORT_FILE, report)
    }

    pub fn write_result(&self, result: &RepairResult) -> Result<PathBuf> {
        self.write_json(REPAIR_RESULT_FILE, result)
    }

    pub fn write_guidance(&self, guidance: &ManualGuidance) -> Result<PathBuf> {
        self.write_json(MANUAL_GUIDANCE_FILE, guidance)
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", name))?;
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(path = %path.display(), "wrote artifact");
        Ok(path)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn append_ignore_entry(path: &Path, entry: &str) -> Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let bare = entry.trim_matches('/');
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed.trim_matches('/') == bare
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# ci-medic artifacts")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::checkpoint::test_support::create_temp_repo;
    use crate::model::{RepairOutcomeKind, RepairResult};
    use git2::{Repository, StatusOptions};

    #[test]
    fn test_artifacts_are_written_and_excluded() {
        let (_dir, repo_path) = create_temp_repo();
        let store = ArtifactStore::new(&repo_path, repo_path.join(".ci-medic"));
        let result = RepairResult::refused(Some("rep-1".to_string()), "protected branch");

        let path = store.write_result(&result).unwrap();
        assert!(path.ends_with(REPAIR_RESULT_FILE));
        assert!(!repo_path.join(".ci-medic").join("repair-result.tmp").exists());

        let back: RepairResult = read_json(&path).unwrap();
        assert_eq!(back.outcome, RepairOutcomeKind::Refused);
        assert_eq!(back.report_id.as_deref(), Some("rep-1"));

        let repo = Repository::open(&repo_path).unwrap();
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        assert!(repo.statuses(Some(&mut opts)).unwrap().is_empty());
    }

    #[test]
    fn test_exclude_entry_written_once() {
        let (_dir, repo_path) = create_temp_repo();
        let store = ArtifactStore::new(&repo_path, repo_path.join("out").join("medic"));
        store.ensure_dir().unwrap();
        store.ensure_dir().unwrap();

        let exclude = fs::read_to_string(repo_path.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches("/out/medic/").count(), 1);
        assert!(!repo_path.join(".gitignore").exists());
    }

    #[test]
    fn test_dir_outside_repo_is_not_excluded() {
        let (_dir, repo_path) = create_temp_repo();
        let elsewhere = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(&repo_path, elsewhere.path().join("artifacts"));
        store.write_json("x.json", &serde_json::json!({"ok": true})).unwrap();

        let exclude =
            fs::read_to_string(repo_path.join(".git/info/exclude")).unwrap_or_default();
        assert!(!exclude.contains("artifacts"));
    }

    #[test]
    fn test_read_json_reports_invalid_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = read_json::<RepairResult>(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
