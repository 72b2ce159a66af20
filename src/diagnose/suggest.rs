//! Per-finding fix suggestions.
//!
//! Commands come straight from the pattern. A `CodeChange` is only offered for
//! a handful of deterministic, line-local transforms, and only when the target
//! file can actually be read under the source root.

use crate::model::{CodeChange, ErrorLocation, FixSuggestion};
use crate::patterns::ErrorPattern;
use crate::util::{path_arg, resolve_repo_file};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub fn suggest_fix(
    pattern: &ErrorPattern,
    location: &ErrorLocation,
    message: &str,
    source_root: Option<&Path>,
) -> FixSuggestion {
    let files = if location.is_known() {
        path_arg(&location.file)
    } else {
        ".".to_string()
    };
    let commands = pattern
        .fix_commands
        .iter()
        .map(|cmd| cmd.replace("{files}", &files))
        .collect();

    let description = if location.is_known() {
        format!("{} ({})", pattern.fix_strategy, location)
    } else {
        pattern.fix_strategy.clone()
    };

    let code_change = source_root
        .filter(|_| location.is_known())
        .and_then(|root| propose_code_change(root, location, message));

    FixSuggestion {
        description,
        commands,
        code_change,
        verification_commands: pattern.verify_commands.clone(),
        estimated_impact: pattern.impact,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    TrailingWhitespace,
    MissingFinalNewline,
    NoneComparison,
}

fn transform_for(message: &str) -> Option<Transform> {
    static RULES: OnceLock<Vec<(Regex, Transform)>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        [
            (r"(?i)\b(?:W291|W293)\b|trailing whitespace|no-trailing-spaces", Transform::TrailingWhitespace),
            (r"(?i)\bW292\b|no newline at end of file|eol-last", Transform::MissingFinalNewline),
            (r"\bE711\b", Transform::NoneComparison),
        ]
        .into_iter()
        .map(|(re, t)| (Regex::new(re).expect("valid transform regex"), t))
        .collect()
    });
    rules
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, t)| *t)
}

fn propose_code_change(root: &Path, location: &ErrorLocation, message: &str) -> Option<CodeChange> {
    let transform = transform_for(message)?;
    let path = resolve_repo_file(root, Path::new(&location.file)).ok()?;
    let content = fs::read_to_string(path).ok()?;

    match transform {
        Transform::TrailingWhitespace => {
            let original = line_at(&content, location.line)?;
            let proposed = original.trim_end();
            (proposed != original).then(|| CodeChange {
                file: location.file.clone(),
                line_start: location.line,
                line_end: location.line,
                original_text: original.to_string(),
                proposed_text: proposed.to_string(),
                explanation: "Remove trailing whitespace".to_string(),
            })
        }
        Transform::MissingFinalNewline => {
            if content.is_empty() || content.ends_with('\n') {
                return None;
            }
            let last_line = content.lines().count() as u32;
            let original = content.lines().last()?.to_string();
            Some(CodeChange {
                file: location.file.clone(),
                line_start: last_line,
                line_end: last_line,
                proposed_text: format!("{}\n", original),
                original_text: original,
                explanation: "Terminate the file with a newline".to_string(),
            })
        }
        Transform::NoneComparison => {
            let original = line_at(&content, location.line)?;
            let proposed = original
                .replace("!= None", "is not None")
                .replace("== None", "is None");
            (proposed != original).then(|| CodeChange {
                file: location.file.clone(),
                line_start: location.line,
                line_end: location.line,
                original_text: original.to_string(),
                proposed_text: proposed,
                explanation: "Compare to None by identity".to_string(),
            })
        }
    }
}

fn line_at(content: &str, line: u32) -> Option<&str> {
    content.lines().nth(line.checked_sub(1)? as usize)
}
