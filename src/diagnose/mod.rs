//! Diagnosis engine
//!
//! Turns raw CI log text into typed, located findings with a single linear
//! pass: every line is normalized, classified against the pattern library
//! (first registered pattern wins), located, and deduplicated on
//! `(family, file, line)` keeping the first occurrence. No cross-line state.

mod suggest;

pub use suggest::suggest_fix;

use crate::model::{
    DiagnosedFinding, DiagnosisMetadata, DiagnosisReport, DiagnosisSummary, ErrorLocation,
    ReportStatus, Severity, WorkflowContext, UNKNOWN_FILE,
};
use crate::patterns::PatternLibrary;
use crate::planner::FixPlanner;
use crate::util::{format_minutes, hash_fields, truncate};
use chrono::Utc;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Lines of log kept on each side of a match.
pub const CONTEXT_RADIUS: usize = 3;
const MAX_CONTEXT_LINE_CHARS: usize = 500;
const MAX_MESSAGE_CHARS: usize = 500;
/// Minutes budgeted per auto-fixable family (tool run + verification).
const AUTO_FIX_MINUTES_PER_FAMILY: u64 = 2;

pub struct DiagnosisEngine {
    library: Arc<PatternLibrary>,
    source_root: Option<PathBuf>,
}

impl DiagnosisEngine {
    pub fn new(library: Arc<PatternLibrary>) -> Self {
        Self {
            library,
            source_root: None,
        }
    }

    /// Allow suggestions to read target files under `root` to propose code changes.
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn diagnose(&self, log: &str, context: &WorkflowContext) -> DiagnosisReport {
        self.diagnose_from(log, context, None)
    }

    /// Like `diagnose`, recording where the log came from in the metadata.
    /// Never fails: unrecognized content simply yields no findings.
    pub fn diagnose_from(
        &self,
        log: &str,
        context: &WorkflowContext,
        log_source: Option<&str>,
    ) -> DiagnosisReport {
        let started = Instant::now();
        let raw_lines: Vec<&str> = log.lines().collect();
        let findings = self.scan(&raw_lines);

        let fix_plan = FixPlanner::new(&self.library).plan(&findings);
        let summary = summarize(&findings);
        let status = report_status(&findings);

        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for finding in &findings {
            *by_category
                .entry(finding.category.as_str().to_string())
                .or_insert(0) += 1;
            *by_severity
                .entry(finding.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        let metadata = DiagnosisMetadata {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            pattern_count: self.library.len(),
            lines_scanned: raw_lines.len(),
            log_source: log_source.map(str::to_string),
            duration_ms: started.elapsed().as_millis() as u64,
            by_category,
            by_severity,
        };

        DiagnosisReport {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            workflow_context: context.clone(),
            status,
            summary,
            findings,
            fix_plan,
            metadata,
        }
    }

    fn scan(&self, raw_lines: &[&str]) -> Vec<DiagnosedFinding> {
        let mut findings = Vec::new();
        let mut seen: HashSet<(String, String, u32)> = HashSet::new();

        for (idx, raw) in raw_lines.iter().enumerate() {
            let line = normalize_line(raw);
            if line.trim().is_empty() {
                continue;
            }

            let Some((pattern, rule, matched)) = self.library.classify(&line) else {
                continue;
            };

            let location = match matched.file.as_deref() {
                Some(file) => ErrorLocation {
                    file: self.clean_path(file),
                    line: matched.line.unwrap_or(1).max(1),
                    column: matched.column,
                    end_line: matched.end_line,
                    end_column: matched.end_column,
                },
                None => ErrorLocation::unknown(),
            };

            let key = (
                pattern.family.clone(),
                location.file.clone(),
                location.line,
            );
            if !seen.insert(key) {
                continue;
            }

            let message = truncate(
                matched.message.as_deref().unwrap_or_else(|| line.trim()),
                MAX_MESSAGE_CHARS,
            );
            let suggested_fix =
                suggest_fix(pattern, &location, &message, self.source_root.as_deref());

            findings.push(DiagnosedFinding {
                id: finding_id(&pattern.family, &location),
                family: pattern.family.clone(),
                severity: pattern.severity,
                category: pattern.category,
                raw_context: context_window(raw_lines, idx),
                message,
                location,
                suggested_fix,
                auto_fixable: pattern.auto_fixable,
                rule_id: rule.id.clone(),
                line_number: idx + 1,
            });
        }

        findings
    }

    /// Strip `./` and, when a source root is known, an absolute checkout prefix.
    fn clean_path(&self, file: &str) -> String {
        let file = file.trim_matches(|c| c == '"' || c == '\'');
        if let Some(root) = &self.source_root {
            if let Ok(relative) = Path::new(file).strip_prefix(root) {
                return relative.to_string_lossy().to_string();
            }
        }
        let cleaned = file.trim_start_matches("./");
        if cleaned.is_empty() {
            UNKNOWN_FILE.to_string()
        } else {
            cleaned.to_string()
        }
    }
}

fn finding_id(family: &str, location: &ErrorLocation) -> String {
    let hash = hash_fields(&[family, &location.file, &location.line.to_string()]);
    format!("fnd-{}", &hash[..12])
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"))
}

fn prefix_regex() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(
            r"^(?:\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z\s?)?(?:##\[(?:error|warning|notice|debug)\])?",
        )
        .expect("valid prefix regex")
    })
}

/// Remove terminal colors, the runner timestamp and `##[error]` annotations.
pub fn normalize_line(raw: &str) -> String {
    let without_ansi = ansi_regex().replace_all(raw, "");
    prefix_regex().replace(&without_ansi, "").into_owned()
}

fn context_window(raw_lines: &[&str], idx: usize) -> String {
    let start = idx.saturating_sub(CONTEXT_RADIUS);
    let end = (idx + CONTEXT_RADIUS + 1).min(raw_lines.len());
    raw_lines[start..end]
        .iter()
        .map(|line| {
            let cleaned = ansi_regex().replace_all(line, "");
            truncate(&cleaned, MAX_CONTEXT_LINE_CHARS)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn report_status(findings: &[DiagnosedFinding]) -> ReportStatus {
    if findings.is_empty() {
        ReportStatus::Success
    } else if findings
        .iter()
        .all(|f| f.auto_fixable && f.severity != Severity::Critical)
    {
        ReportStatus::Partial
    } else {
        ReportStatus::Failure
    }
}

fn summarize(findings: &[DiagnosedFinding]) -> DiagnosisSummary {
    let total = findings.len();
    let critical = findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .count();
    let auto_fixable = findings.iter().filter(|f| f.auto_fixable).count();

    DiagnosisSummary {
        total_findings: total,
        critical_findings: critical,
        auto_fixable_findings: auto_fixable,
        manual_fix_required: total - auto_fixable,
        primary_issue: primary_issue(findings),
        estimated_fix_duration: estimate_duration(findings),
    }
}

/// First critical finding, else the most frequent family, else "no errors".
fn primary_issue(findings: &[DiagnosedFinding]) -> String {
    if let Some(critical) = findings.iter().find(|f| f.severity == Severity::Critical) {
        return critical.message.clone();
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for finding in findings {
        let count = counts.entry(finding.family.as_str()).or_insert(0);
        if *count == 0 {
            order.push(finding.family.as_str());
        }
        *count += 1;
    }

    // Strictly greater keeps the earliest family on ties.
    let mut best: Option<(&str, usize)> = None;
    for family in order {
        let count = counts[family];
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((family, count));
        }
    }

    match best {
        Some((family, count)) => format!("{}: {} finding(s)", family, count),
        None => "no errors".to_string(),
    }
}

fn estimate_duration(findings: &[DiagnosedFinding]) -> String {
    let auto_families: HashSet<&str> = findings
        .iter()
        .filter(|f| f.auto_fixable)
        .map(|f| f.family.as_str())
        .collect();
    let manual: u64 = findings
        .iter()
        .filter(|f| !f.auto_fixable)
        .map(|f| f.severity.manual_minutes())
        .sum();
    format_minutes(auto_families.len() as u64 * AUTO_FIX_MINUTES_PER_FAMILY + manual)
}
