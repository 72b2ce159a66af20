//! Configuration for ci-medic
//!
//! Read from `<repo>/.ci-medic.toml`, else `~/.config/ci-medic/config.toml`,
//! else built-in defaults. A few settings can be overridden from the
//! environment so CI jobs can tune a run without editing files.

use crate::exec::checkpoint::CommitAuthor;
use crate::exec::RepairPolicy;
use crate::patterns::{PatternError, PatternLibrary, PatternSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const REPO_CONFIG_FILE: &str = ".ci-medic.toml";
pub const DEFAULT_ARTIFACT_DIR: &str = ".ci-medic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Added to the built-in protected branches; cannot remove any.
    pub protected_branches: Vec<String>,
    /// Extra programs fix and verify steps may run.
    pub allowed_programs: Vec<String>,
    pub retry: RetryConfig,
    pub step_timeout_secs: u64,
    pub rollback_enabled: bool,
    pub artifacts: ArtifactsConfig,
    pub publish: PublishConfig,
    pub commit: CommitConfig,
    pub patterns: Vec<PatternSpec>,
    /// File this config was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub request_review: bool,
    pub remote: String,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protected_branches: Vec::new(),
            allowed_programs: Vec::new(),
            retry: RetryConfig::default(),
            step_timeout_secs: 300,
            rollback_enabled: true,
            artifacts: ArtifactsConfig::default(),
            publish: PublishConfig::default(),
            commit: CommitConfig::default(),
            patterns: Vec::new(),
            source: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_review: true,
            remote: "origin".to_string(),
            base_branch: None,
        }
    }
}

impl Config {
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ci-medic").join("config.toml"))
    }

    /// Paths searched in order; the first existing file wins.
    pub fn candidate_paths(repo_root: &Path) -> Vec<PathBuf> {
        let mut paths = vec![repo_root.join(REPO_CONFIG_FILE)];
        paths.extend(Self::user_config_path());
        paths
    }

    /// Load config for a repository and apply environment overrides.
    pub fn load(repo_root: &Path) -> Self {
        let mut config = Self::load_from(&Self::candidate_paths(repo_root));
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// First existing file among `paths`, or defaults. A malformed file is
    /// reported and ignored.
    pub fn load_from(paths: &[PathBuf]) -> Self {
        let Some(path) = paths.iter().find(|p| p.is_file()) else {
            debug!("no config file found; using defaults");
            return Self::default();
        };
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path.display(), "could not read config ({}); using defaults", err);
                return Self::default();
            }
        };
        match Self::parse(&content) {
            Ok(mut config) => {
                debug!(path = %path.display(), "loaded config");
                config.source = Some(path.clone());
                config
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "config file is malformed ({}); using defaults",
                    err
                );
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `CI_MEDIC_MAX_RETRIES`, `CI_MEDIC_DISABLE_PUBLISH`, `CI_MEDIC_ARTIFACT_DIR`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("CI_MEDIC_MAX_RETRIES") {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => self.retry.max_attempts = n,
                _ => warn!(value = %raw, "ignoring invalid CI_MEDIC_MAX_RETRIES"),
            }
        }
        if let Some(raw) = lookup("CI_MEDIC_DISABLE_PUBLISH") {
            if is_truthy(&raw) {
                self.publish.enabled = false;
            }
        }
        if let Some(raw) = lookup("CI_MEDIC_ARTIFACT_DIR") {
            if !raw.trim().is_empty() {
                self.artifacts.dir = PathBuf::from(raw.trim());
            }
        }
    }

    /// Built-in patterns plus `[[patterns]]`.
    pub fn pattern_library(&self) -> Result<PatternLibrary, PatternError> {
        PatternLibrary::with_custom(&self.patterns)
    }

    pub fn artifact_dir(&self, repo_root: &Path) -> PathBuf {
        if self.artifacts.dir.is_absolute() {
            self.artifacts.dir.clone()
        } else {
            repo_root.join(&self.artifacts.dir)
        }
    }

    pub fn commit_author(&self) -> Option<CommitAuthor> {
        match (&self.commit.author_name, &self.commit.author_email) {
            (Some(name), Some(email)) => Some(CommitAuthor {
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        }
    }

    pub fn repair_policy(&self) -> RepairPolicy {
        RepairPolicy {
            auto_publish: self.publish.enabled,
            request_review: self.publish.request_review,
            max_retries: self.retry.max_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry.backoff_ms),
            step_timeout: Duration::from_secs(self.step_timeout_secs.max(1)),
            rollback_enabled: self.rollback_enabled,
            protected_branches: self.protected_branches.clone(),
            remote: self.publish.remote.clone(),
            base_branch: self.publish.base_branch.clone(),
            commit_author: self.commit_author(),
            ..RepairPolicy::default()
        }
    }

    pub fn config_location(&self) -> String {
        match &self.source {
            Some(path) => path.display().to_string(),
            None => "(defaults)".to_string(),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
