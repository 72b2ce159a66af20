//! Repair executor
//!
//! Runs a fix plan against a working tree:
//! `INIT -> CHECKPOINT -> RUN_STEP* -> VERIFY -> (COMMIT -> PUBLISH | ROLLBACK) -> DONE`.
//!
//! INIT refusals are the only errors. Everything after the checkpoint is
//! reported through `RepairResult`, and any failure before a commit exists
//! rolls the repository back to the checkpoint.

pub mod checkpoint;
pub mod lock;
pub mod runner;

use crate::model::{
    DiagnosisReport, ExitPolicy, FixPlan, FixStep, ManualGuidance, RepairOutcomeKind,
    RepairResult, StepAction, StepResult,
};
use crate::planner::FALLBACK_VERIFY_COMMAND;
use crate::publish::{PublishRequest, Publisher};
use crate::util::tail_output;
use chrono::Utc;
use checkpoint::{Checkpoint, CommitAuthor};
use lock::{LockError, RepairLock};
use runner::CommandRunner;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Branches that never receive automated changes. Configuration can add to
/// this list but not remove from it. A trailing `*` matches by prefix.
pub const BUILTIN_PROTECTED_BRANCHES: &[&str] =
    &["main", "master", "production", "release", "release/*"];

const MAX_STEP_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct RepairPolicy {
    pub dry_run: bool,
    pub auto_commit: bool,
    pub auto_publish: bool,
    pub request_review: bool,
    /// Branch to publish to; defaults to the checked-out branch.
    pub target_branch: Option<String>,
    /// Attempts per step, including the first.
    pub max_retries: u32,
    /// Linear backoff: attempt `n` waits `n * retry_backoff` before retrying.
    pub retry_backoff: Duration,
    pub step_timeout: Duration,
    pub rollback_enabled: bool,
    /// Added to `BUILTIN_PROTECTED_BRANCHES`.
    pub protected_branches: Vec<String>,
    pub remote: String,
    pub base_branch: Option<String>,
    pub commit_author: Option<CommitAuthor>,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            dry_run: false,
            auto_commit: true,
            auto_publish: true,
            request_review: true,
            target_branch: None,
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            step_timeout: Duration::from_secs(300),
            rollback_enabled: true,
            protected_branches: Vec::new(),
            remote: "origin".to_string(),
            base_branch: None,
            commit_author: None,
        }
    }
}

impl RepairPolicy {
    pub fn is_protected(&self, branch: &str) -> bool {
        is_protected_branch(branch, &self.protected_branches)
    }
}

pub fn is_protected_branch(branch: &str, extra: &[String]) -> bool {
    BUILTIN_PROTECTED_BRANCHES
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => branch.starts_with(prefix),
            None => branch == pattern,
        })
}

/// INIT-time refusals. Nothing has been run or touched when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("plan has no fix steps")]
    EmptyPlan,
    #[error("branch '{0}' is protected and never receives automated changes")]
    ProtectedBranch(String),
    #[error("no target branch: HEAD is detached and none was configured")]
    NoTargetBranch,
    #[error("repository is busy: {0}")]
    Busy(String),
    #[error("repository error: {0}")]
    Repository(String),
}

impl RepairError {
    fn repository(err: anyhow::Error) -> Self {
        RepairError::Repository(format!("{:#}", err))
    }
}

#[derive(Debug)]
pub enum RepairOutcome {
    Executed(RepairResult),
    /// Nothing was auto-fixable; the repository was not touched.
    Manual(ManualGuidance),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub workdir: PathBuf,
    /// Branch a successful repair is published to.
    pub target: String,
}

pub struct RepairExecutor {
    repo_path: PathBuf,
    runner: Box<dyn CommandRunner>,
    publisher: Box<dyn Publisher>,
}

/// What a rollback left behind.
enum RollbackState {
    Restored,
    Failed(String),
    Disabled,
}

impl RepairExecutor {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        runner: Box<dyn CommandRunner>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            runner,
            publisher,
        }
    }

    /// Execute the report's plan, or hand back manual guidance when nothing
    /// in it can be fixed automatically.
    pub fn run(
        &self,
        report: &DiagnosisReport,
        policy: &RepairPolicy,
    ) -> Result<RepairOutcome, RepairError> {
        if !report.fix_plan.can_auto_fix {
            info!(
                report = %report.id,
                findings = report.findings.len(),
                "no auto-fixable findings; producing manual guidance"
            );
            return Ok(RepairOutcome::Manual(ManualGuidance::from_report(report)));
        }
        self.execute(&report.fix_plan, policy, Some(&report.id))
            .map(RepairOutcome::Executed)
    }

    /// Resolve the working tree and target branch, refusing protected
    /// branches. Reads the repository only.
    pub fn preflight(&self, policy: &RepairPolicy) -> Result<Preflight, RepairError> {
        let workdir = checkpoint::workdir(&self.repo_path).map_err(RepairError::repository)?;
        let current = checkpoint::current_branch(&workdir).map_err(RepairError::repository)?;
        let target = policy
            .target_branch
            .clone()
            .or_else(|| current.clone())
            .ok_or(RepairError::NoTargetBranch)?;
        for branch in std::iter::once(&target).chain(current.as_ref()) {
            if policy.is_protected(branch) {
                warn!(branch = %branch, "refusing to repair a protected branch");
                return Err(RepairError::ProtectedBranch(branch.clone()));
            }
        }
        Ok(Preflight { workdir, target })
    }

    pub fn execute(
        &self,
        plan: &FixPlan,
        policy: &RepairPolicy,
        report_id: Option<&str>,
    ) -> Result<RepairResult, RepairError> {
        let started_at = Utc::now();
        let fix_steps: Vec<&FixStep> = plan.fix_steps().collect();
        if fix_steps.is_empty() {
            return Err(RepairError::EmptyPlan);
        }

        // INIT
        let Preflight { workdir, target } = self.preflight(policy)?;
        let git_dir = checkpoint::git_dir(&workdir).map_err(RepairError::repository)?;
        let lock = RepairLock::acquire(&git_dir).map_err(|err| match err {
            LockError::Held(path) => RepairError::Busy(path.display().to_string()),
            other => RepairError::Repository(other.to_string()),
        })?;
        debug!(lock = %lock.path().display(), "repair lock acquired");
        info!(
            branch = %target,
            steps = fix_steps.len(),
            dry_run = policy.dry_run,
            "repair run initialized"
        );

        let mut run = Run {
            report_id: report_id.map(str::to_string),
            started_at,
            step_results: Vec::new(),
        };

        if policy.dry_run {
            for step in &plan.steps {
                run.step_results.push(skipped(step, "dry run: would run"));
            }
            return Ok(run.finish(
                RepairOutcomeKind::DryRun,
                0,
                0,
                format!("Dry run: {} fix step(s) planned, nothing executed", fix_steps.len()),
            ));
        }

        // CHECKPOINT
        let checkpoint = checkpoint::create(&workdir, report_id.unwrap_or("manual"))
            .map_err(RepairError::repository)?;
        info!(head = %checkpoint.head, stashed = checkpoint.stash.is_some(), "checkpoint recorded");

        // RUN_STEP
        for step in &fix_steps {
            let result = self.run_step(step, &workdir, policy);
            let failed = !result.success;
            run.step_results.push(result);
            if failed {
                warn!(order = step.order, "fix step failed; rolling back");
                let reason = format!("fix step {} ({}) failed", step.order, step_label(step));
                return Ok(self.roll_back(run, &workdir, &checkpoint, policy, plan, &reason));
            }
        }

        // VERIFY
        let verify = plan.verify_step().cloned().unwrap_or_else(fallback_verify_step);
        let result = self.run_step(&verify, &workdir, policy);
        let verified = result.success;
        run.step_results.push(result);
        if !verified {
            warn!("verification failed; rolling back");
            return Ok(self.roll_back(run, &workdir, &checkpoint, policy, plan, "verification failed"));
        }

        let publish_order = plan
            .steps
            .iter()
            .find(|s| s.action == StepAction::Publish)
            .map(|s| s.order)
            .unwrap_or(plan.steps.len() + 1);
        let fixed_ids: usize = fix_steps.iter().map(|s| s.finding_ids.len()).sum();

        let changed = match checkpoint::has_changes_since(&workdir, &checkpoint) {
            Ok(changed) => changed,
            Err(err) => {
                let reason = format!("could not inspect working tree: {:#}", err);
                return Ok(self.roll_back(run, &workdir, &checkpoint, policy, plan, &reason));
            }
        };

        if changed {
            match checkpoint::changed_paths(&workdir) {
                Ok(paths) => info!(files = %paths.join(" "), "fix steps changed the working tree"),
                Err(err) => debug!(error = %format!("{:#}", err), "could not list changed paths"),
            }
        } else {
            info!("fix steps produced no changes");
            run.step_results
                .push(skipped_order(publish_order, "no changes to commit"));
            let note = restore_pre_existing(&workdir, &checkpoint);
            return Ok(run.finish(
                RepairOutcomeKind::NoChanges,
                0,
                0,
                with_note("All steps succeeded without changing any file".to_string(), note),
            ));
        }

        if !policy.auto_commit {
            run.step_results
                .push(skipped_order(publish_order, "auto-commit disabled"));
            let note = restore_pre_existing(&workdir, &checkpoint);
            return Ok(run.finish(
                RepairOutcomeKind::FixedUncommitted,
                fixed_ids,
                0,
                with_note(
                    "Fixes verified and left uncommitted in the working tree".to_string(),
                    note,
                ),
            ));
        }

        // COMMIT
        let publish_started = Instant::now();
        let message = commit_message(plan, report_id);
        let commit = checkpoint::stage_all(&workdir)
            .and_then(|_| checkpoint::commit(&workdir, &message, policy.commit_author.as_ref()));
        let commit_ref = match commit {
            Ok(oid) => oid,
            Err(err) => {
                let reason = format!("commit failed: {:#}", err);
                run.step_results.push(StepResult {
                    order: publish_order,
                    action: StepAction::Publish,
                    success: false,
                    output: String::new(),
                    error: Some(reason.clone()),
                    duration_ms: publish_started.elapsed().as_millis() as u64,
                    attempts: 1,
                    skipped: false,
                });
                return Ok(self.roll_back(run, &workdir, &checkpoint, policy, plan, &reason));
            }
        };
        info!(commit = %commit_ref, "remediation committed");
        let note = restore_pre_existing(&workdir, &checkpoint);

        // PUBLISH
        let (outcome, published, publish_error, mut summary) = if policy.auto_publish {
            let request = PublishRequest {
                repo_path: workdir.clone(),
                remote: policy.remote.clone(),
                branch: target.clone(),
                base_branch: policy.base_branch.clone(),
                request_review: policy.request_review,
                title: first_line(&message).to_string(),
                body: review_body(plan, report_id),
            };
            match self.publisher.publish(&request) {
                Ok(receipt) => {
                    let summary = format!("Fixed and published as {}", receipt.change_ref);
                    let summary = match receipt.note {
                        Some(n) => format!("{} ({})", summary, n),
                        None => summary,
                    };
                    (RepairOutcomeKind::Published, Some(receipt.change_ref), None, summary)
                }
                Err(err) => {
                    let error = format!("{:#}", err);
                    warn!(error = %error, "publish failed; keeping local commit");
                    (
                        RepairOutcomeKind::PublishFailed,
                        None,
                        Some(error),
                        format!("Fixed locally in {}, publish failed", short(&commit_ref)),
                    )
                }
            }
        } else {
            (
                RepairOutcomeKind::CommittedLocally,
                None,
                None,
                format!("Fixed locally in {}; publishing disabled", short(&commit_ref)),
            )
        };
        summary = with_note(summary, note);

        run.step_results.push(StepResult {
            order: publish_order,
            action: StepAction::Publish,
            success: publish_error.is_none(),
            output: match &published {
                Some(change) => format!("committed {}\npublished {}", commit_ref, change),
                None => format!("committed {}", commit_ref),
            },
            error: publish_error,
            duration_ms: publish_started.elapsed().as_millis() as u64,
            attempts: 1,
            skipped: false,
        });

        let mut result = run.finish(outcome, fixed_ids, 0, summary);
        result.commit_ref = Some(commit_ref);
        result.published_change_ref = published;
        Ok(result)
    }

    /// Run every command of a step, retrying the whole step with linear backoff.
    fn run_step(&self, step: &FixStep, workdir: &Path, policy: &RepairPolicy) -> StepResult {
        let started = Instant::now();
        let commands = step_commands(step);
        let max_attempts = policy.max_retries.max(1);

        let mut attempts = 0;
        let mut output = String::new();
        let mut error = None;
        while attempts < max_attempts {
            attempts += 1;
            output.clear();
            error = None;
            let mut retryable = true;

            for command in &commands {
                debug!(order = step.order, attempt = attempts, command = %command, "running");
                // Judged against the tree as this command found it, not as the step found it.
                let baseline = match step.exit_policy {
                    ExitPolicy::ChangesMeanSuccess => checkpoint::fingerprint(workdir).ok(),
                    ExitPolicy::Strict => None,
                };
                match self.runner.run(command, workdir, policy.step_timeout) {
                    Ok(out) => {
                        output.push_str(&format!("$ {}\n{}\n", command, out.combined()));
                        if out.timed_out {
                            error = Some(format!(
                                "'{}' timed out after {}s",
                                command,
                                policy.step_timeout.as_secs()
                            ));
                            break;
                        }
                        if out.success() {
                            continue;
                        }
                        if changes_mean_success(step.exit_policy, baseline.as_deref(), workdir) {
                            debug!(command = %command, "non-zero exit with changes counts as success");
                            continue;
                        }
                        error = Some(format!(
                            "'{}' exited with status {}",
                            command,
                            out.exit_code.map_or("unknown".to_string(), |c| c.to_string())
                        ));
                        break;
                    }
                    Err(err) => {
                        // Rejections are deterministic; retrying cannot help.
                        retryable = false;
                        error = Some(err.to_string());
                        break;
                    }
                }
            }

            if error.is_none() || !retryable {
                break;
            }
            if attempts < max_attempts {
                let delay = policy.retry_backoff * attempts;
                warn!(
                    order = step.order,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "step failed; retrying"
                );
                thread::sleep(delay);
            }
        }

        StepResult {
            order: step.order,
            action: step.action,
            success: error.is_none(),
            output: tail_output(&output, MAX_STEP_OUTPUT_CHARS),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            skipped: false,
        }
    }

    fn roll_back(
        &self,
        run: Run,
        workdir: &Path,
        checkpoint: &Checkpoint,
        policy: &RepairPolicy,
        plan: &FixPlan,
        reason: &str,
    ) -> RepairResult {
        let failed: usize = plan.fix_steps().map(|s| s.finding_ids.len()).sum();
        let state = if !policy.rollback_enabled {
            warn!("rollback disabled by configuration; leaving the working tree as-is");
            RollbackState::Disabled
        } else {
            match checkpoint::rollback(workdir, checkpoint) {
                Ok(()) => {
                    info!(head = %checkpoint.head, "rolled back to checkpoint");
                    RollbackState::Restored
                }
                Err(err) => {
                    // Not retried: the repository was changed underneath us.
                    warn!("rollback failed: {:#}", err);
                    RollbackState::Failed(format!("{:#}", err))
                }
            }
        };

        let (outcome, summary) = match state {
            RollbackState::Restored => (
                RepairOutcomeKind::RolledBack,
                format!("Attempted fix failed and was rolled back: {}", reason),
            ),
            RollbackState::Failed(err) => (
                RepairOutcomeKind::RollbackFailed,
                format!("{}; rollback failed: {}", reason, err),
            ),
            RollbackState::Disabled => (
                RepairOutcomeKind::RollbackFailed,
                format!(
                    "{}; rollback disabled, working tree left at the failed state",
                    reason
                ),
            ),
        };
        let mut result = run.finish(outcome, 0, failed, summary);
        result.rollback_required = true;
        result
    }
}

struct Run {
    report_id: Option<String>,
    started_at: chrono::DateTime<Utc>,
    step_results: Vec<StepResult>,
}

impl Run {
    fn finish(
        self,
        outcome: RepairOutcomeKind,
        total_fixed: usize,
        total_failed: usize,
        summary: String,
    ) -> RepairResult {
        RepairResult {
            report_id: self.report_id,
            success: outcome.is_success(),
            outcome,
            step_results: self.step_results,
            total_fixed,
            total_failed,
            commit_ref: None,
            published_change_ref: None,
            rollback_required: false,
            summary,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn changes_mean_success(policy: ExitPolicy, baseline: Option<&str>, workdir: &Path) -> bool {
    match (policy, baseline) {
        (ExitPolicy::ChangesMeanSuccess, Some(before)) => checkpoint::fingerprint(workdir)
            .map(|after| after != before)
            .unwrap_or(false),
        _ => false,
    }
}

/// Commands of a step; plans written before `commands` existed only carry
/// the rendered `command`.
fn step_commands(step: &FixStep) -> Vec<String> {
    if !step.commands.is_empty() {
        return step.commands.clone();
    }
    step.command
        .split("&&")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn fallback_verify_step() -> FixStep {
    FixStep {
        order: 0,
        action: StepAction::Verify,
        command: FALLBACK_VERIFY_COMMAND.to_string(),
        commands: vec![FALLBACK_VERIFY_COMMAND.to_string()],
        target_files: Vec::new(),
        description: "Check the working tree for whitespace errors".to_string(),
        rollback_command: None,
        family: None,
        finding_ids: Vec::new(),
        exit_policy: ExitPolicy::Strict,
    }
}

fn skipped(step: &FixStep, prefix: &str) -> StepResult {
    StepResult {
        order: step.order,
        action: step.action,
        success: true,
        output: format!("{}: {}", prefix, step.command),
        error: None,
        duration_ms: 0,
        attempts: 0,
        skipped: true,
    }
}

fn skipped_order(order: usize, reason: &str) -> StepResult {
    StepResult {
        order,
        action: StepAction::Publish,
        success: true,
        output: format!("skipped: {}", reason),
        error: None,
        duration_ms: 0,
        attempts: 0,
        skipped: true,
    }
}

/// Pop the checkpoint stash; a failure is reported, never fatal.
fn restore_pre_existing(workdir: &Path, checkpoint: &Checkpoint) -> Option<String> {
    let stash = checkpoint.stash?;
    match checkpoint::restore_stash(workdir, stash) {
        Ok(()) => None,
        Err(err) => {
            warn!("could not re-apply pre-existing changes: {:#}", err);
            Some(format!(
                "pre-existing changes could not be re-applied and remain in git stash ({})",
                stash
            ))
        }
    }
}

fn with_note(summary: String, note: Option<String>) -> String {
    match note {
        Some(note) => format!("{}; {}", summary, note),
        None => summary,
    }
}

fn step_label(step: &FixStep) -> &str {
    step.family.as_deref().unwrap_or(step.command.as_str())
}

fn commit_message(plan: &FixPlan, report_id: Option<&str>) -> String {
    let mut message = format!(
        "fix(ci): automated remediation for {}\n\n",
        plan.families().join(", ")
    );
    for step in plan.fix_steps() {
        message.push_str(&format!("- {}\n", step.description));
    }
    if let Some(id) = report_id {
        message.push_str(&format!("\nDiagnosis-Report: {}\n", id));
    }
    message
}

fn review_body(plan: &FixPlan, report_id: Option<&str>) -> String {
    let mut body = String::from("Automated remediation of CI failures.\n\n");
    for step in plan.fix_steps() {
        body.push_str(&format!(
            "- **{}**: `{}` ({} finding(s))\n",
            step_label(step),
            step.command,
            step.finding_ids.len()
        ));
    }
    if plan.requires_review {
        body.push_str("\nThis change includes fixes that need a careful review.\n");
    }
    if let Some(id) = report_id {
        body.push_str(&format!("\nDiagnosis report: `{}`\n", id));
    }
    body
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}

fn short(oid: &str) -> &str {
    &oid[..oid.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::checkpoint::test_support::*;
    use super::runner::RunnerError;
    use super::*;
    use crate::model::{
        DiagnosisMetadata, DiagnosisSummary, ReportStatus, WorkflowContext,
    };
    use crate::publish::PublishReceipt;
    use crate::util::ProcessOutput;
    use git2::Repository;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::{Arc, Mutex};

    type Handler = dyn Fn(&str, &Path, usize) -> i32 + Send + Sync;

    /// Handler return value that reports the command as timed out.
    const TIMES_OUT: i32 = i32::MIN;

    /// Records every command; the handler sees the command, cwd and how many
    /// times that command ran before, and returns an exit code.
    struct ScriptedRunner {
        calls: Arc<Mutex<Vec<String>>>,
        handler: Box<Handler>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(
            &self,
            command: &str,
            cwd: &Path,
            _timeout: Duration,
        ) -> Result<ProcessOutput, RunnerError> {
            let previous = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.iter().filter(|c| c.as_str() == command).count();
                calls.push(command.to_string());
                n
            };
            let code = (self.handler)(command, cwd, previous);
            let timed_out = code == TIMES_OUT;
            Ok(ProcessOutput {
                exit_code: (!timed_out).then_some(code),
                stdout: format!("ran {}", command),
                stderr: String::new(),
                timed_out,
                duration: Duration::ZERO,
            })
        }
    }

    struct RecordingPublisher {
        requests: Arc<Mutex<Vec<PublishRequest>>>,
        fail: bool,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, request: &PublishRequest) -> anyhow::Result<PublishReceipt> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                anyhow::bail!("remote rejected push");
            }
            Ok(PublishReceipt {
                change_ref: "https://github.com/acme/app/pull/7".to_string(),
                note: None,
            })
        }
    }

    struct Harness {
        executor: RepairExecutor,
        calls: Arc<Mutex<Vec<String>>>,
        published: Arc<Mutex<Vec<PublishRequest>>>,
    }

    fn harness(
        repo_path: &Path,
        publish_fails: bool,
        handler: impl Fn(&str, &Path, usize) -> i32 + Send + Sync + 'static,
    ) -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(Mutex::new(Vec::new()));
        let executor = RepairExecutor::new(
            repo_path,
            Box::new(ScriptedRunner {
                calls: calls.clone(),
                handler: Box::new(handler),
            }),
            Box::new(RecordingPublisher {
                requests: published.clone(),
                fail: publish_fails,
            }),
        );
        Harness {
            executor,
            calls,
            published,
        }
    }

    fn policy() -> RepairPolicy {
        RepairPolicy {
            retry_backoff: Duration::ZERO,
            ..RepairPolicy::default()
        }
    }

    fn step(order: usize, action: StepAction, command: &str) -> FixStep {
        FixStep {
            order,
            action,
            command: command.to_string(),
            commands: vec![command.to_string()],
            target_files: Vec::new(),
            description: format!("run {}", command),
            rollback_command: None,
            family: (action == StepAction::Fix)
                .then(|| command.split_whitespace().next().unwrap_or("x").to_string()),
            finding_ids: if action == StepAction::Fix {
                vec![format!("fnd-{}", order)]
            } else {
                Vec::new()
            },
            exit_policy: ExitPolicy::Strict,
        }
    }

    fn plan(fix_commands: &[&str], verify: &str) -> FixPlan {
        let mut steps: Vec<FixStep> = fix_commands
            .iter()
            .enumerate()
            .map(|(i, cmd)| step(i + 1, StepAction::Fix, cmd))
            .collect();
        steps.push(step(steps.len() + 1, StepAction::Verify, verify));
        steps.push(step(steps.len() + 1, StepAction::Publish, "git add -A && git commit && git push"));
        FixPlan {
            can_auto_fix: true,
            steps,
            requires_review: false,
            rollback_plan: Vec::new(),
        }
    }

    fn write(cwd: &Path, rel: &str, content: &str) {
        let path = cwd.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn file_handler(
        effects: HashMap<&'static str, (&'static str, &'static str, i32)>,
    ) -> impl Fn(&str, &Path, usize) -> i32 + Send + Sync + 'static {
        move |command, cwd, _| match effects.get(command) {
            Some((rel, content, code)) => {
                if !rel.is_empty() {
                    write(cwd, rel, content);
                }
                *code
            }
            None => 0,
        }
    }

    #[test]
    fn test_successful_fix_is_committed_and_published() {
        let (_dir, repo_path) = create_temp_repo();
        commit_file(&repo_path, "src/app.py", "x=1\n");
        let before = head_id(&repo_path);

        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([("black src/app.py", ("src/app.py", "x = 1\n", 0))])),
        );
        let result = h
            .executor
            .execute(&plan(&["black src/app.py"], "black --check ."), &policy(), Some("rep-1"))
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::Published);
        assert_eq!(result.total_fixed, 1);
        assert_eq!(result.total_failed, 0);
        assert!(!result.rollback_required);
        assert_eq!(
            result.published_change_ref.as_deref(),
            Some("https://github.com/acme/app/pull/7")
        );
        assert_eq!(result.report_id.as_deref(), Some("rep-1"));
        assert_eq!(result.step_results.len(), 3);

        let head = head_id(&repo_path);
        assert_ne!(head, before);
        assert_eq!(result.commit_ref.as_deref(), Some(head.as_str()));
        let repo = Repository::open(&repo_path).unwrap();
        let commit = repo.head().unwrap().peel_to_commit().unwrap();
        let message = commit.message().unwrap();
        assert!(message.starts_with("fix(ci): automated remediation for black"));
        assert!(message.contains("Diagnosis-Report: rep-1"));

        let published = h.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].branch, "feature/ci-fix");
        assert_eq!(published[0].remote, "origin");
    }

    #[test]
    fn test_protected_branch_runs_nothing() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("main", &head, true).unwrap();
        repo.set_head("refs/heads/main").unwrap();

        let h = harness(&repo_path, false, |_, _, _| 0);
        for p in [
            policy(),
            RepairPolicy {
                dry_run: true,
                ..policy()
            },
            RepairPolicy {
                auto_commit: false,
                auto_publish: false,
                rollback_enabled: false,
                ..policy()
            },
        ] {
            let err = h
                .executor
                .execute(&plan(&["black ."], "black --check ."), &p, None)
                .unwrap_err();
            assert!(matches!(err, RepairError::ProtectedBranch(ref b) if b == "main"));
        }
        assert!(h.calls.lock().unwrap().is_empty());
        assert!(!repo_path.join(".git").join(lock::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_configured_and_prefix_protected_targets_are_refused() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |_, _, _| 0);

        let p = RepairPolicy {
            target_branch: Some("release/2.4".to_string()),
            ..policy()
        };
        let err = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &p, None)
            .unwrap_err();
        assert!(matches!(err, RepairError::ProtectedBranch(_)));

        let p = RepairPolicy {
            protected_branches: vec!["feature/*".to_string()],
            ..policy()
        };
        let err = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &p, None)
            .unwrap_err();
        assert!(matches!(err, RepairError::ProtectedBranch(ref b) if b == "feature/ci-fix"));
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_is_protected_branch_matching() {
        assert!(is_protected_branch("main", &[]));
        assert!(is_protected_branch("release/1.0", &[]));
        assert!(is_protected_branch("release", &[]));
        assert!(!is_protected_branch("releases", &[]));
        assert!(!is_protected_branch("feature/main", &[]));
        assert!(is_protected_branch("staging", &["staging".to_string()]));
    }

    #[test]
    fn test_detached_head_without_target_is_refused() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap().id();
        repo.set_head_detached(head).unwrap();

        let h = harness(&repo_path, false, |_, _, _| 0);
        let err = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap_err();
        assert!(matches!(err, RepairError::NoTargetBranch));
    }

    #[test]
    fn test_empty_plan_is_refused() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |_, _, _| 0);
        let err = h
            .executor
            .execute(&FixPlan::default(), &policy(), None)
            .unwrap_err();
        assert!(matches!(err, RepairError::EmptyPlan));
    }

    #[test]
    fn test_concurrent_run_is_busy() {
        let (_dir, repo_path) = create_temp_repo();
        let held = RepairLock::acquire(&repo_path.join(".git")).unwrap();

        let h = harness(&repo_path, false, |_, _, _| 0);
        let err = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap_err();
        assert!(matches!(err, RepairError::Busy(_)));
        assert!(h.calls.lock().unwrap().is_empty());
        drop(held);
    }

    #[test]
    fn test_failed_step_rolls_back_to_checkpoint_exactly() {
        let (_dir, repo_path) = create_temp_repo();
        commit_file(&repo_path, "src/a.py", "a=1\n");
        commit_file(&repo_path, "src/b.py", "b=1\n");
        write(&repo_path, "src/a.py", "a=1  # wip\n");
        write(&repo_path, "scratch.txt", "notes\n");
        let head_before = head_id(&repo_path);
        let tree_before = checkpoint::fingerprint(&repo_path).unwrap();

        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([
                ("black src/a.py", ("src/a.py", "a = 1\n", 0)),
                ("autopep8 --in-place src/b.py", ("src/new_module.py", "half-written", 1)),
                ("isort src", ("", "", 0)),
            ])),
        );
        let result = h
            .executor
            .execute(
                &plan(
                    &["black src/a.py", "autopep8 --in-place src/b.py", "isort src"],
                    "flake8",
                ),
                &policy(),
                Some("rep-2"),
            )
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert!(result.rollback_required);
        assert_eq!(result.total_fixed, 0);
        assert_eq!(result.total_failed, 3);
        assert!(result.commit_ref.is_none());
        // Third step and verification never ran
        assert_eq!(result.step_results.len(), 2);
        assert!(result.step_results[0].success);
        let failed = &result.step_results[1];
        assert!(!failed.success);
        assert_eq!(failed.attempts, 3);
        assert!(failed.error.as_deref().unwrap().contains("exited with status 1"));
        assert!(!h.calls.lock().unwrap().iter().any(|c| c == "isort src"));

        assert_eq!(head_id(&repo_path), head_before);
        assert_eq!(checkpoint::fingerprint(&repo_path).unwrap(), tree_before);
        assert_eq!(fs::read_to_string(repo_path.join("src/a.py")).unwrap(), "a=1  # wip\n");
        assert!(repo_path.join("scratch.txt").exists());
        assert!(!repo_path.join("src/new_module.py").exists());
        assert!(h.published.lock().unwrap().is_empty());
    }

    #[test]
    fn test_verify_failure_after_two_fixes_rolls_back() {
        let (_dir, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "a=1\n");
        commit_file(&repo_path, "b.ts", "let b = 1\n");
        let head_before = head_id(&repo_path);
        let tree_before = checkpoint::fingerprint(&repo_path).unwrap();

        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([
                ("black a.py", ("a.py", "a = 1\n", 0)),
                ("npx prettier --write b.ts", ("b.ts", "let b = 1;\n", 0)),
                ("npm test", ("", "", 1)),
            ])),
        );
        let result = h
            .executor
            .execute(
                &plan(&["black a.py", "npx prettier --write b.ts"], "npm test"),
                &policy(),
                None,
            )
            .unwrap();

        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert!(result.rollback_required);
        let actions: Vec<StepAction> = result.step_results.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![StepAction::Fix, StepAction::Fix, StepAction::Verify]);
        assert!(!result.step_results[2].success);
        assert_eq!(head_id(&repo_path), head_before);
        assert_eq!(checkpoint::fingerprint(&repo_path).unwrap(), tree_before);
        assert_eq!(fs::read_to_string(repo_path.join("a.py")).unwrap(), "a=1\n");
    }

    #[test]
    fn test_no_op_run_is_success_without_commit() {
        let (_dir, repo_path) = create_temp_repo();
        write(&repo_path, "wip.txt", "mine\n");
        let head_before = head_id(&repo_path);

        let h = harness(&repo_path, false, |_, _, _| 0);
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::NoChanges);
        assert!(result.commit_ref.is_none());
        assert_eq!(result.total_fixed, 0);
        assert_eq!(head_id(&repo_path), head_before);
        assert!(result.step_results.last().unwrap().skipped);
        assert!(h.published.lock().unwrap().is_empty());
        // Pre-existing work came back
        assert_eq!(fs::read_to_string(repo_path.join("wip.txt")).unwrap(), "mine\n");
        assert_eq!(stash_count(&repo_path), 0);
    }

    #[test]
    fn test_non_zero_exit_with_changes_counts_as_success() {
        let (_dir, repo_path) = create_temp_repo();
        commit_file(&repo_path, "src/utils.ts", "var x = 1\n");

        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([(
                "npx eslint --fix src/utils.ts",
                ("src/utils.ts", "const x = 1\n", 1),
            )])),
        );
        let mut lint_plan = plan(&["npx eslint --fix src/utils.ts"], "git diff --check");
        lint_plan.steps[0].exit_policy = ExitPolicy::ChangesMeanSuccess;
        let p = RepairPolicy {
            auto_publish: false,
            ..policy()
        };
        let result = h.executor.execute(&lint_plan, &p, None).unwrap();

        assert!(result.step_results[0].success);
        assert_eq!(result.step_results[0].attempts, 1);
        assert_eq!(result.outcome, RepairOutcomeKind::CommittedLocally);
        assert!(result.commit_ref.is_some());
    }

    #[test]
    fn test_non_zero_exit_without_changes_fails_even_when_lenient() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |_, _, _| 1);
        let mut lint_plan = plan(&["npx eslint --fix ."], "git diff --check");
        lint_plan.steps[0].exit_policy = ExitPolicy::ChangesMeanSuccess;

        let result = h.executor.execute(&lint_plan, &policy(), None).unwrap();
        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert_eq!(result.step_results[0].attempts, 3);
    }

    #[test]
    fn test_strict_step_with_changes_still_fails_on_non_zero_exit() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([("black .", ("x.py", "x = 1\n", 1))])),
        );
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap();
        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert!(!repo_path.join("x.py").exists());
    }

    #[test]
    fn test_retry_does_not_credit_changes_from_an_earlier_attempt() {
        let (_dir, repo_path) = create_temp_repo();
        commit_file(&repo_path, "src/utils.ts", "var x = 1\n");
        let h = harness(&repo_path, false, |command, cwd, previous| {
            if command != "npx eslint --fix ." {
                return 0;
            }
            if previous == 0 {
                write(cwd, "src/utils.ts", "const x = 1\n");
                return TIMES_OUT;
            }
            1
        });
        let mut lint_plan = plan(&["npx eslint --fix ."], "git diff --check");
        lint_plan.steps[0].exit_policy = ExitPolicy::ChangesMeanSuccess;

        let result = h.executor.execute(&lint_plan, &policy(), None).unwrap();
        let fix = &result.step_results[0];
        assert!(!fix.success);
        assert_eq!(fix.attempts, 3);
        assert!(fix.error.as_deref().unwrap().contains("exited with status 1"));
        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert_eq!(
            fs::read_to_string(repo_path.join("src/utils.ts")).unwrap(),
            "var x = 1\n"
        );
    }

    #[test]
    fn test_each_command_is_judged_on_its_own_changes() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |command, cwd, _| match command {
            "npx prettier --write ." => {
                write(cwd, "src/a.ts", "export const a = 1;\n");
                0
            }
            _ => 1,
        });
        let mut lint_plan = plan(&["npx prettier --write ."], "git diff --check");
        lint_plan.steps[0].commands = vec![
            "npx prettier --write .".to_string(),
            "npx eslint --fix .".to_string(),
        ];
        lint_plan.steps[0].exit_policy = ExitPolicy::ChangesMeanSuccess;

        let result = h.executor.execute(&lint_plan, &policy(), None).unwrap();
        assert!(!result.step_results[0].success);
        assert_eq!(result.outcome, RepairOutcomeKind::RolledBack);
        assert!(!repo_path.join("src/a.ts").exists());
    }

    #[test]
    fn test_preflight_refuses_protected_branch_without_side_effects() {
        let (_dir, repo_path) = create_temp_repo();
        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("master", &head, true).unwrap();
        repo.set_head("refs/heads/master").unwrap();
        let exclude = repo_path.join(".git").join("info").join("exclude");
        let exclude_before = fs::read_to_string(&exclude).ok();

        let h = harness(&repo_path, false, |_, _, _| 0);
        let err = h.executor.preflight(&policy()).unwrap_err();
        assert!(matches!(err, RepairError::ProtectedBranch(ref b) if b == "master"));
        assert!(!repo_path.join(".git").join(lock::LOCK_FILE_NAME).exists());
        assert_eq!(fs::read_to_string(&exclude).ok(), exclude_before);
        assert_eq!(stash_count(&repo_path), 0);

        repo.set_head("refs/heads/feature/ci-fix").unwrap();
        let ok = h.executor.preflight(&policy()).unwrap();
        assert_eq!(ok.target, "feature/ci-fix");
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |command, cwd, previous| {
            if command == "black ." {
                if previous == 0 {
                    return 1;
                }
                write(cwd, "fixed.py", "ok = True\n");
            }
            0
        });
        let p = RepairPolicy {
            auto_publish: false,
            ..policy()
        };
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &p, None)
            .unwrap();

        assert_eq!(result.step_results[0].attempts, 2);
        assert!(result.step_results[0].success);
        assert_eq!(result.outcome, RepairOutcomeKind::CommittedLocally);
    }

    #[test]
    fn test_publish_failure_keeps_commit() {
        let (_dir, repo_path) = create_temp_repo();
        let before = head_id(&repo_path);
        let h = harness(
            &repo_path,
            true,
            file_handler(HashMap::from([("black .", ("fmt.py", "x = 1\n", 0))])),
        );
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::PublishFailed);
        assert!(!result.rollback_required);
        assert!(result.published_change_ref.is_none());
        let publish = result.step_results.last().unwrap();
        assert_eq!(publish.action, StepAction::Publish);
        assert!(!publish.success);
        assert!(publish.error.as_deref().unwrap().contains("remote rejected push"));
        assert_ne!(head_id(&repo_path), before);
        assert!(repo_path.join("fmt.py").exists());
    }

    #[test]
    fn test_uncommitted_mode_leaves_verified_changes() {
        let (_dir, repo_path) = create_temp_repo();
        let before = head_id(&repo_path);
        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([("black .", ("fmt.py", "x = 1\n", 0))])),
        );
        let p = RepairPolicy {
            auto_commit: false,
            ..policy()
        };
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &p, None)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::FixedUncommitted);
        assert!(result.commit_ref.is_none());
        assert_eq!(head_id(&repo_path), before);
        assert!(repo_path.join("fmt.py").exists());
    }

    #[test]
    fn test_pre_existing_work_is_restored_after_commit() {
        let (_dir, repo_path) = create_temp_repo();
        write(&repo_path, "notes/todo.md", "- ship it\n");
        let h = harness(
            &repo_path,
            false,
            file_handler(HashMap::from([("black .", ("fmt.py", "x = 1\n", 0))])),
        );
        let result = h
            .executor
            .execute(&plan(&["black ."], "black --check ."), &policy(), None)
            .unwrap();

        assert_eq!(result.outcome, RepairOutcomeKind::Published);
        let repo = Repository::open(&repo_path).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("fmt.py").is_some());
        assert!(tree.get_name("notes").is_none());
        assert!(repo_path.join("notes/todo.md").exists());
        assert_eq!(stash_count(&repo_path), 0);
    }

    #[test]
    fn test_dry_run_skips_every_step() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |_, _, _| 0);
        let p = RepairPolicy {
            dry_run: true,
            ..policy()
        };
        let result = h
            .executor
            .execute(&plan(&["black .", "ruff check --fix ."], "ruff check ."), &p, None)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outcome, RepairOutcomeKind::DryRun);
        assert_eq!(result.step_results.len(), 4);
        assert!(result.step_results.iter().all(|r| r.skipped && r.attempts == 0));
        assert!(result.step_results[0].output.contains("black ."));
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_manual_fallback_does_not_touch_repository() {
        let (_dir, repo_path) = create_temp_repo();
        let h = harness(&repo_path, false, |_, _, _| 0);
        let report = DiagnosisReport {
            id: "rep-manual".to_string(),
            timestamp: Utc::now(),
            workflow_context: WorkflowContext::default(),
            status: ReportStatus::Failure,
            summary: DiagnosisSummary {
                total_findings: 0,
                critical_findings: 0,
                auto_fixable_findings: 0,
                manual_fix_required: 0,
                primary_issue: "no errors".to_string(),
                estimated_fix_duration: "0m".to_string(),
            },
            findings: Vec::new(),
            fix_plan: FixPlan::default(),
            metadata: DiagnosisMetadata::default(),
        };

        match h.executor.run(&report, &policy()).unwrap() {
            RepairOutcome::Manual(guidance) => assert_eq!(guidance.report_id, "rep-manual"),
            RepairOutcome::Executed(_) => panic!("expected manual guidance"),
        }
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_step_without_commands_splits_rendered_command() {
        let mut s = step(1, StepAction::Verify, "flake8 && mypy .");
        s.commands.clear();
        assert_eq!(step_commands(&s), vec!["flake8", "mypy ."]);
    }
}
