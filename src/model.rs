//! Diagnosis, plan and repair value types.
//!
//! These serialize to the JSON artifacts consumed by the report renderer and
//! the registry, so field names are camelCase and changes must be additive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder file name for findings whose location could not be extracted.
pub const UNKNOWN_FILE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Syntax,
    Type,
    Lint,
    Format,
    Test,
    Build,
    Security,
    Runtime,
    Configuration,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Syntax => "syntax",
            Category::Type => "type",
            Category::Lint => "lint",
            Category::Format => "format",
            Category::Test => "test",
            Category::Build => "build",
            Category::Security => "security",
            Category::Runtime => "runtime",
            Category::Configuration => "configuration",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Rough hands-on minutes to resolve one finding of this severity manually.
    pub fn manual_minutes(&self) -> u64 {
        match self {
            Severity::Critical => 30,
            Severity::High => 20,
            Severity::Medium => 10,
            Severity::Low => 5,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatedImpact {
    Safe,
    ReviewRequired,
    Breaking,
}

/// How a fix command's exit status is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Only exit status 0 is success.
    #[default]
    Strict,
    /// The tool exits non-zero whenever it rewrote something (or left
    /// unfixable leftovers); success iff the working tree changed.
    ChangesMeanSuccess,
}

impl ExitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitPolicy::Strict => "strict",
            ExitPolicy::ChangesMeanSuccess => "changes-mean-success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLocation {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
}

impl ErrorLocation {
    pub fn unknown() -> Self {
        Self {
            file: UNKNOWN_FILE.to_string(),
            line: 1,
            column: None,
            end_line: None,
            end_column: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.file != UNKNOWN_FILE
    }
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}:{}", self.file, self.line, col),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChange {
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
    pub original_text: String,
    pub proposed_text: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSuggestion {
    pub description: String,
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_change: Option<CodeChange>,
    pub verification_commands: Vec<String>,
    pub estimated_impact: EstimatedImpact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosedFinding {
    pub id: String,
    pub family: String,
    pub severity: Severity,
    pub category: Category,
    pub location: ErrorLocation,
    pub message: String,
    pub raw_context: String,
    pub suggested_fix: FixSuggestion,
    pub auto_fixable: bool,
    /// Match rule that produced this finding.
    pub rule_id: String,
    /// 1-based line in the log where the match occurred.
    pub line_number: usize,
}

impl DiagnosedFinding {
    /// Identity key: two findings are the same iff family, file and line agree.
    pub fn identity(&self) -> (&str, &str, u32) {
        (&self.family, &self.location.file, self.location.line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisSummary {
    pub total_findings: usize,
    pub critical_findings: usize,
    pub auto_fixable_findings: usize,
    pub manual_fix_required: usize,
    pub primary_issue: String,
    pub estimated_fix_duration: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisMetadata {
    pub engine_version: String,
    pub pattern_count: usize,
    pub lines_scanned: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_source: Option<String>,
    pub duration_ms: u64,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
}

/// Immutable once produced; persisted as the diagnosis artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_context: WorkflowContext,
    pub status: ReportStatus,
    pub summary: DiagnosisSummary,
    pub findings: Vec<DiagnosedFinding>,
    pub fix_plan: FixPlan,
    pub metadata: DiagnosisMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Fix,
    Verify,
    Publish,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Fix => "fix",
            StepAction::Verify => "verify",
            StepAction::Publish => "publish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixStep {
    pub order: usize,
    pub action: StepAction,
    /// Human-readable rendering of `commands`.
    pub command: String,
    /// Commands run in sequence; every one must succeed.
    #[serde(default)]
    pub commands: Vec<String>,
    pub target_files: Vec<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default)]
    pub finding_ids: Vec<String>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixPlan {
    pub can_auto_fix: bool,
    pub steps: Vec<FixStep>,
    pub requires_review: bool,
    pub rollback_plan: Vec<String>,
}

impl FixPlan {
    pub fn fix_steps(&self) -> impl Iterator<Item = &FixStep> {
        self.steps.iter().filter(|s| s.action == StepAction::Fix)
    }

    pub fn verify_step(&self) -> Option<&FixStep> {
        self.steps.iter().find(|s| s.action == StepAction::Verify)
    }

    /// Families touched by fix steps, in plan order.
    pub fn families(&self) -> Vec<&str> {
        self.fix_steps()
            .filter_map(|s| s.family.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub order: usize,
    pub action: StepAction,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairOutcomeKind {
    Published,
    CommittedLocally,
    FixedUncommitted,
    PublishFailed,
    NoChanges,
    DryRun,
    RolledBack,
    RollbackFailed,
    Refused,
}

impl RepairOutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RepairOutcomeKind::Published
                | RepairOutcomeKind::CommittedLocally
                | RepairOutcomeKind::FixedUncommitted
                | RepairOutcomeKind::PublishFailed
                | RepairOutcomeKind::NoChanges
                | RepairOutcomeKind::DryRun
        )
    }
}

/// One execution attempt. A retry produces a new result, never a mutation of this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub report_id: Option<String>,
    pub success: bool,
    pub outcome: RepairOutcomeKind,
    pub step_results: Vec<StepResult>,
    pub total_fixed: usize,
    pub total_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_change_ref: Option<String>,
    pub rollback_required: bool,
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RepairResult {
    /// Result recorded when INIT refused to run; nothing was touched.
    pub fn refused(report_id: Option<String>, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            report_id,
            success: false,
            outcome: RepairOutcomeKind::Refused,
            step_results: Vec::new(),
            total_fixed: 0,
            total_failed: 0,
            commit_ref: None,
            published_change_ref: None,
            rollback_required: false,
            summary: format!("Repair refused: {}", reason),
            started_at: now,
            finished_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualGuidanceItem {
    pub finding_id: String,
    pub family: String,
    pub severity: Severity,
    pub location: ErrorLocation,
    pub message: String,
    pub suggestion: FixSuggestion,
}

/// Hand-off document produced when nothing can be fixed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualGuidance {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub items: Vec<ManualGuidanceItem>,
}

impl ManualGuidance {
    /// Every finding that is not auto-fixable, most severe first.
    pub fn from_report(report: &DiagnosisReport) -> Self {
        let mut items: Vec<ManualGuidanceItem> = report
            .findings
            .iter()
            .filter(|f| !f.auto_fixable)
            .map(|f| ManualGuidanceItem {
                finding_id: f.id.clone(),
                family: f.family.clone(),
                severity: f.severity,
                location: f.location.clone(),
                message: f.message.clone(),
                suggestion: f.suggested_fix.clone(),
            })
            .collect();
        items.sort_by_key(|item| item.severity);

        let summary = if items.is_empty() {
            "No manual action required".to_string()
        } else {
            format!(
                "{} finding(s) need manual attention; primary issue: {}",
                items.len(),
                report.summary.primary_issue
            )
        };

        Self {
            report_id: report.id.clone(),
            generated_at: Utc::now(),
            summary,
            items,
        }
    }
}
