//! Where the log and the workflow context come from.

use crate::model::WorkflowContext;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

pub const CONVENTIONAL_LOG_FILE: &str = "ci.log";
pub const LOG_ENV_VAR: &str = "CI_MEDIC_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    /// Path or env var name, recorded in the report metadata.
    pub label: String,
    pub content: String,
}

/// Resolve the log to diagnose: `--log`, then `<artifact-dir>/ci.log`, then
/// the newest `*.log` under `<artifact-dir>/logs/`, then `CI_MEDIC_LOG`.
pub fn resolve_log(
    explicit: Option<&Path>,
    artifact_dir: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<LogSource> {
    if let Some(path) = explicit {
        return read_log(path);
    }

    let conventional = artifact_dir.join(CONVENTIONAL_LOG_FILE);
    if conventional.is_file() {
        return read_log(&conventional);
    }

    if let Some(path) = newest_log(&artifact_dir.join("logs")) {
        return read_log(&path);
    }

    if let Some(content) = env(LOG_ENV_VAR).filter(|c| !c.trim().is_empty()) {
        return Ok(LogSource {
            label: format!("${}", LOG_ENV_VAR),
            content,
        });
    }

    bail!(
        "No CI log found: pass --log, place it at {}, or set {}",
        conventional.display(),
        LOG_ENV_VAR
    )
}

fn read_log(path: &Path) -> Result<LogSource> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read log {}", path.display()))?;
    Ok(LogSource {
        label: path.display().to_string(),
        content: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Most recently modified `*.log` under `dir`, searched recursively.
pub fn newest_log(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, e.into_path()))
        })
        // Ties broken by path so the choice is stable.
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, path)| path)
}

/// Workflow context from GitHub Actions or GitLab CI variables; any field
/// set in `overrides` wins.
pub fn workflow_context(
    env: impl Fn(&str) -> Option<String>,
    overrides: WorkflowContext,
) -> WorkflowContext {
    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| env(k))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    };

    WorkflowContext {
        workflow: overrides
            .workflow
            .or_else(|| first(&["GITHUB_WORKFLOW", "CI_PIPELINE_NAME"])),
        run_id: overrides
            .run_id
            .or_else(|| first(&["GITHUB_RUN_ID", "CI_PIPELINE_ID"])),
        commit: overrides
            .commit
            .or_else(|| first(&["GITHUB_SHA", "CI_COMMIT_SHA"])),
        branch: overrides.branch.or_else(|| {
            first(&["GITHUB_HEAD_REF", "GITHUB_REF_NAME", "CI_COMMIT_REF_NAME"])
        }),
    }
}
