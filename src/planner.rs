//! Fix planner: merges auto-fixable findings into one step per family.
//!
//! Planning is a pure function of the findings and the pattern library. It
//! never looks at the working tree; whether a non-zero exit still counts as a
//! successful fix is decided by the executor from the step's exit policy.

use crate::model::{
    DiagnosedFinding, EstimatedImpact, ExitPolicy, FixPlan, FixStep, Severity, StepAction,
};
use crate::patterns::PatternLibrary;
use crate::util::path_arg;
use std::collections::HashSet;

/// Verification used when no family declares its own.
pub const FALLBACK_VERIFY_COMMAND: &str = "git diff --check";
pub const PUBLISH_COMMAND: &str = "git add -A && git commit && git push";

pub struct FixPlanner<'a> {
    library: &'a PatternLibrary,
}

struct FamilyGroup<'f> {
    family: &'f str,
    findings: Vec<&'f DiagnosedFinding>,
}

impl<'a> FixPlanner<'a> {
    pub fn new(library: &'a PatternLibrary) -> Self {
        Self { library }
    }

    pub fn plan(&self, findings: &[DiagnosedFinding]) -> FixPlan {
        let requires_review = findings.iter().any(|f| {
            f.severity == Severity::Critical
                || (f.auto_fixable && f.suggested_fix.estimated_impact != EstimatedImpact::Safe)
        });

        let mut fixable: Vec<&DiagnosedFinding> =
            findings.iter().filter(|f| f.auto_fixable).collect();
        if fixable.is_empty() {
            return FixPlan {
                can_auto_fix: false,
                steps: Vec::new(),
                requires_review,
                rollback_plan: Vec::new(),
            };
        }
        fixable.sort_by_key(|f| f.severity);

        let mut groups: Vec<FamilyGroup> = Vec::new();
        for finding in fixable {
            match groups.iter_mut().find(|g| g.family == finding.family) {
                Some(group) => group.findings.push(finding),
                None => groups.push(FamilyGroup {
                    family: &finding.family,
                    findings: vec![finding],
                }),
            }
        }

        let mut steps: Vec<FixStep> = groups
            .iter()
            .enumerate()
            .map(|(idx, group)| self.fix_step(idx + 1, group))
            .collect();

        let verify_commands = self.verify_commands(&groups);
        steps.push(FixStep {
            order: steps.len() + 1,
            action: StepAction::Verify,
            command: verify_commands.join(" && "),
            commands: verify_commands,
            target_files: Vec::new(),
            description: "Verify the fixes with the affected tools".to_string(),
            rollback_command: None,
            family: None,
            finding_ids: Vec::new(),
            exit_policy: ExitPolicy::Strict,
        });

        steps.push(FixStep {
            order: steps.len() + 1,
            action: StepAction::Publish,
            command: PUBLISH_COMMAND.to_string(),
            commands: Vec::new(),
            target_files: Vec::new(),
            description: "Stage, commit and publish the remediation".to_string(),
            rollback_command: None,
            family: None,
            finding_ids: Vec::new(),
            exit_policy: ExitPolicy::Strict,
        });

        FixPlan {
            can_auto_fix: true,
            steps,
            requires_review,
            rollback_plan: vec![
                "git reset --hard <checkpoint>".to_string(),
                "git clean -fd".to_string(),
                "git stash pop (when the checkpoint stashed changes)".to_string(),
            ],
        }
    }

    fn fix_step(&self, order: usize, group: &FamilyGroup) -> FixStep {
        let target_files = unique(
            group
                .findings
                .iter()
                .filter(|f| f.location.is_known())
                .map(|f| f.location.file.clone()),
        );
        // A single unlocated finding means the tool has to run over the whole tree.
        let whole_tree = target_files.is_empty()
            || group.findings.iter().any(|f| !f.location.is_known());
        let files_arg = if whole_tree {
            ".".to_string()
        } else {
            target_files
                .iter()
                .map(|f| path_arg(f))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let pattern = self.library.get(group.family);
        let commands = match pattern {
            Some(p) if !p.fix_commands.is_empty() => p
                .fix_commands
                .iter()
                .map(|cmd| cmd.replace("{files}", &files_arg))
                .collect(),
            // Family not in this library (e.g. a stored report): reuse the suggestions.
            _ => unique(
                group
                    .findings
                    .iter()
                    .flat_map(|f| f.suggested_fix.commands.iter().cloned()),
            ),
        };

        let description = match pattern {
            Some(p) => format!(
                "{} ({} finding(s))",
                p.fix_strategy,
                group.findings.len()
            ),
            None => format!("Apply {} fixes ({} finding(s))", group.family, group.findings.len()),
        };

        let rollback_command = Some(if whole_tree {
            "git checkout -- .".to_string()
        } else {
            format!("git checkout -- {}", files_arg)
        });

        FixStep {
            order,
            action: StepAction::Fix,
            command: commands.join(" && "),
            commands,
            target_files,
            description,
            rollback_command,
            family: Some(group.family.to_string()),
            finding_ids: group.findings.iter().map(|f| f.id.clone()).collect(),
            exit_policy: pattern.map(|p| p.exit_policy).unwrap_or_default(),
        }
    }

    fn verify_commands(&self, groups: &[FamilyGroup]) -> Vec<String> {
        let commands = unique(groups.iter().flat_map(|group| {
            match self.library.get(group.family) {
                Some(p) => p.verify_commands.clone(),
                None => group
                    .findings
                    .iter()
                    .flat_map(|f| f.suggested_fix.verification_commands.iter().cloned())
                    .collect(),
            }
        }));
        if commands.is_empty() {
            vec![FALLBACK_VERIFY_COMMAND.to_string()]
        } else {
            commands
        }
    }
}

fn unique(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(item.clone())).collect()
}
