//! Error pattern library
//!
//! One `ErrorPattern` per tool/error family. Registration order is priority:
//! when several patterns match a line, the first registered wins, so the table
//! lists specific signatures first and the generic catch-all last.
//!
//! The library is an immutable value. Build it once and hand it to the
//! diagnosis engine and planner; tests can build their own.

use crate::model::{Category, EstimatedImpact, ExitPolicy, Severity};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Family of the catch-all pattern; custom patterns are inserted before it.
pub const CATCH_ALL_FAMILY: &str = "generic";

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern '{0}' has no match rules")]
    NoRules(String),

    #[error("pattern '{0}' is auto-fixable but declares no fix command")]
    MissingFixCommand(String),

    #[error("duplicate pattern family '{0}'")]
    DuplicateFamily(String),

    #[error("invalid regex in rule '{rule}': {source}")]
    InvalidRegex {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Location fields pulled out of a matching line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMatch {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub end_line: Option<u32>,
    pub end_column: Option<u32>,
    pub message: Option<String>,
}

/// A regex over a single normalized log line. Named groups `file`, `line`,
/// `column`, `end_line`, `end_column` and `message` are extracted when present.
#[derive(Debug, Clone)]
pub struct MatchRule {
    pub id: String,
    regex: Regex,
}

impl MatchRule {
    pub fn new(id: &str, pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(pattern).map_err(|source| PatternError::InvalidRegex {
            rule: id.to_string(),
            source,
        })?;
        Ok(Self {
            id: id.to_string(),
            regex,
        })
    }

    pub fn apply(&self, line: &str) -> Option<RuleMatch> {
        let caps = self.regex.captures(line)?;
        Some(RuleMatch {
            file: text_group(&caps, "file"),
            line: number_group(&caps, "line"),
            column: number_group(&caps, "column"),
            end_line: number_group(&caps, "end_line"),
            end_column: number_group(&caps, "end_column"),
            message: text_group(&caps, "message"),
        })
    }
}

fn text_group(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn number_group(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub family: String,
    pub description: String,
    pub category: Category,
    pub severity: Severity,
    pub rules: Vec<MatchRule>,
    pub auto_fixable: bool,
    pub fix_strategy: String,
    /// May contain `{files}`, replaced with the affected files at planning time.
    pub fix_commands: Vec<String>,
    pub verify_commands: Vec<String>,
    pub impact: EstimatedImpact,
    pub exit_policy: ExitPolicy,
}

impl ErrorPattern {
    /// First rule matching `line`, with its extracted fields.
    pub fn match_line(&self, line: &str) -> Option<(&MatchRule, RuleMatch)> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(line).map(|m| (rule, m)))
    }

    fn validate(&self) -> Result<(), PatternError> {
        if self.rules.is_empty() {
            return Err(PatternError::NoRules(self.family.clone()));
        }
        if self.auto_fixable && self.fix_commands.is_empty() {
            return Err(PatternError::MissingFixCommand(self.family.clone()));
        }
        Ok(())
    }
}

/// Pattern as written in configuration (`[[patterns]]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub family: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: Category,
    pub severity: Severity,
    pub rules: Vec<String>,
    #[serde(default)]
    pub auto_fixable: bool,
    #[serde(default)]
    pub fix_strategy: Option<String>,
    #[serde(default)]
    pub fix_commands: Vec<String>,
    #[serde(default)]
    pub verify_commands: Vec<String>,
    #[serde(default)]
    pub impact: Option<EstimatedImpact>,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

impl PatternSpec {
    pub fn compile(&self) -> Result<ErrorPattern, PatternError> {
        let rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, pattern)| MatchRule::new(&format!("{}#{}", self.family, i + 1), pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ErrorPattern {
            family: self.family.clone(),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| format!("{} error", self.family)),
            category: self.category,
            severity: self.severity,
            rules,
            auto_fixable: self.auto_fixable,
            fix_strategy: self
                .fix_strategy
                .clone()
                .unwrap_or_else(|| "Review the reported error".to_string()),
            fix_commands: self.fix_commands.clone(),
            verify_commands: self.verify_commands.clone(),
            impact: self.impact.unwrap_or(if self.auto_fixable {
                EstimatedImpact::Safe
            } else {
                EstimatedImpact::ReviewRequired
            }),
            exit_policy: self.exit_policy,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PatternLibrary {
    patterns: Vec<ErrorPattern>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<ErrorPattern>) -> Result<Self, PatternError> {
        let mut seen = HashSet::new();
        for pattern in &patterns {
            pattern.validate()?;
            if !seen.insert(pattern.family.as_str()) {
                return Err(PatternError::DuplicateFamily(pattern.family.clone()));
            }
        }
        Ok(Self { patterns })
    }

    /// Built-in table plus custom patterns, which slot in ahead of the catch-all.
    pub fn with_custom(custom: &[PatternSpec]) -> Result<Self, PatternError> {
        let mut patterns = builtin_specs()
            .iter()
            .map(PatternSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let insert_at = patterns
            .iter()
            .position(|p| p.family == CATCH_ALL_FAMILY)
            .unwrap_or(patterns.len());
        for (offset, spec) in custom.iter().enumerate() {
            patterns.insert(insert_at + offset, spec.compile()?);
        }

        Self::new(patterns)
    }

    pub fn builtin() -> Result<Self, PatternError> {
        Self::with_custom(&[])
    }

    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    pub fn get(&self, family: &str) -> Option<&ErrorPattern> {
        self.patterns.iter().find(|p| p.family == family)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern (in registration order) with a rule matching `line`.
    pub fn classify(&self, line: &str) -> Option<(&ErrorPattern, &MatchRule, RuleMatch)> {
        self.patterns.iter().find_map(|pattern| {
            pattern
                .match_line(line)
                .map(|(rule, m)| (pattern, rule, m))
        })
    }
}

struct Builtin {
    family: &'static str,
    description: &'static str,
    category: Category,
    severity: Severity,
    rules: &'static [&'static str],
    auto_fixable: bool,
    fix_strategy: &'static str,
    fix_commands: &'static [&'static str],
    verify_commands: &'static [&'static str],
    impact: EstimatedImpact,
    exit_policy: ExitPolicy,
}

fn builtin_specs() -> Vec<PatternSpec> {
    BUILTINS
        .iter()
        .map(|b| PatternSpec {
            family: b.family.to_string(),
            description: Some(b.description.to_string()),
            category: b.category,
            severity: b.severity,
            rules: b.rules.iter().map(|r| r.to_string()).collect(),
            auto_fixable: b.auto_fixable,
            fix_strategy: Some(b.fix_strategy.to_string()),
            fix_commands: b.fix_commands.iter().map(|c| c.to_string()).collect(),
            verify_commands: b.verify_commands.iter().map(|c| c.to_string()).collect(),
            impact: Some(b.impact),
            exit_policy: b.exit_policy,
        })
        .collect()
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        family: "typescript",
        description: "TypeScript compilation error",
        category: Category::Type,
        severity: Severity::High,
        rules: &[
            r"^(?P<file>[^\s(]+)\((?P<line>\d+),(?P<column>\d+)\): error (?P<message>TS\d+: .*)$",
            r"^(?P<file>[^\s:]+\.(?:ts|tsx|mts|cts)):(?P<line>\d+):(?P<column>\d+) - error (?P<message>TS\d+: .*)$",
            r"\berror (?P<message>TS\d+: .*)$",
        ],
        auto_fixable: false,
        fix_strategy: "Check type definitions and imports at the reported location",
        fix_commands: &[],
        verify_commands: &["npx tsc --noEmit"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "eslint",
        description: "ESLint violation",
        category: Category::Lint,
        severity: Severity::Low,
        rules: &[
            r"^(?P<file>\S+): line (?P<line>\d+), col (?P<column>\d+), (?:Error|Warning) - (?P<message>.*)$",
            concat!(
                r"^(?P<file>[^\s:]+\.(?:js|jsx|ts|tsx|mjs|cjs|vue)):(?P<line>\d+):(?P<column>\d+): ",
                r"(?P<message>.*\[(?:Error|Warning)/[\w@/-]+\])$"
            ),
        ],
        auto_fixable: true,
        fix_strategy: "Run ESLint with --fix on the affected files",
        fix_commands: &["npx eslint --fix {files}"],
        verify_commands: &["npx eslint ."],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::ChangesMeanSuccess,
    },
    Builtin {
        family: "prettier",
        description: "Prettier formatting drift",
        category: Category::Format,
        severity: Severity::Low,
        rules: &[
            r"^\[warn\] (?P<file>[^\s\[\]]+\.(?:js|jsx|ts|tsx|mjs|cjs|vue|json|css|scss|md|ya?ml|html))$",
            r"Prettier.*(?:error|failed)",
        ],
        auto_fixable: true,
        fix_strategy: "Rewrite the affected files with Prettier",
        fix_commands: &["npx prettier --write {files}"],
        verify_commands: &["npx prettier --check ."],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "black",
        description: "Black formatting drift",
        category: Category::Format,
        severity: Severity::Low,
        rules: &[r"^would reformat (?P<file>\S+\.pyi?)$"],
        auto_fixable: true,
        fix_strategy: "Reformat the affected files with Black",
        fix_commands: &["black {files}"],
        verify_commands: &["black --check ."],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "ruff",
        description: "Ruff lint violation",
        category: Category::Lint,
        severity: Severity::Low,
        rules: &[
            r"^(?P<file>[^\s:]+\.pyi?):(?P<line>\d+):(?P<column>\d+): (?P<message>[A-Z]{1,4}\d{3,4} \[\*\] .*)$",
        ],
        auto_fixable: true,
        fix_strategy: "Apply Ruff's safe autofixes",
        fix_commands: &["ruff check --fix {files}"],
        verify_commands: &["ruff check ."],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::ChangesMeanSuccess,
    },
    Builtin {
        family: "flake8",
        description: "Flake8 style violation",
        category: Category::Lint,
        severity: Severity::Low,
        rules: &[
            r"^(?P<file>[^\s:]+\.py):(?P<line>\d+):(?P<column>\d+): (?P<message>[EWC]\d{3} .*)$",
        ],
        auto_fixable: true,
        fix_strategy: "Reformat with autopep8 to resolve PEP 8 violations",
        fix_commands: &["autopep8 --in-place {files}"],
        verify_commands: &["flake8"],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "mypy",
        description: "Mypy type error",
        category: Category::Type,
        severity: Severity::High,
        rules: &[r"^(?P<file>[^\s:]+\.pyi?):(?P<line>\d+)(?::(?P<column>\d+))?: error: (?P<message>.*)$"],
        auto_fixable: false,
        fix_strategy: "Correct the annotated types or the call site",
        fix_commands: &[],
        verify_commands: &["mypy ."],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "python-syntax",
        description: "Python syntax error",
        category: Category::Syntax,
        severity: Severity::High,
        rules: &[
            r#"^\s*File "(?P<file>[^"]+\.py)", line (?P<line>\d+)$"#,
            r"^(?P<message>(?:SyntaxError|IndentationError|TabError): .*)$",
        ],
        auto_fixable: false,
        fix_strategy: "Fix the syntax at the reported line",
        fix_commands: &[],
        verify_commands: &["python -m compileall -q ."],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "rustfmt",
        description: "rustfmt formatting drift",
        category: Category::Format,
        severity: Severity::Low,
        rules: &[r"^Diff in (?P<file>\S+\.rs)(?: at line | at line:|:)(?P<line>\d+):?$"],
        auto_fixable: true,
        fix_strategy: "Reformat with cargo fmt",
        fix_commands: &["cargo fmt --all"],
        verify_commands: &["cargo fmt --all -- --check"],
        impact: EstimatedImpact::Safe,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "rustc",
        description: "Rust compilation error",
        category: Category::Build,
        severity: Severity::High,
        rules: &[
            r"^error\[E\d{4}\]: (?P<message>.*)$",
            r"^error: (?P<message>(?:could not compile|aborting due to) .*)$",
            r"^\s*--> (?P<file>[^\s:]+\.rs):(?P<line>\d+):(?P<column>\d+)$",
        ],
        auto_fixable: false,
        fix_strategy: "Resolve the compiler error at the reported span",
        fix_commands: &[],
        verify_commands: &["cargo check --all-targets"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "go",
        description: "Go build or vet error",
        category: Category::Build,
        severity: Severity::High,
        rules: &[r"^(?:\./)?(?P<file>[^\s:]+\.go):(?P<line>\d+):(?P<column>\d+): (?P<message>.*)$"],
        auto_fixable: false,
        fix_strategy: "Resolve the compiler or vet error at the reported location",
        fix_commands: &[],
        verify_commands: &["go vet ./..."],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "jest",
        description: "Jest test failure",
        category: Category::Test,
        severity: Severity::Medium,
        rules: &[r"^\s*FAIL\s+(?P<file>\S+\.(?:test|spec)\.(?:js|jsx|ts|tsx|mjs|cjs))"],
        auto_fixable: false,
        fix_strategy: "Inspect the failing assertions and the code under test",
        fix_commands: &[],
        verify_commands: &["npm test"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "pytest",
        description: "Pytest failure",
        category: Category::Test,
        severity: Severity::Medium,
        rules: &[
            r"^FAILED (?P<file>[^\s:]+\.py)::(?P<message>\S+(?: - .*)?)$",
            r"^(?P<file>[^\s:]+\.py):(?P<line>\d+): (?P<message>AssertionError.*)$",
        ],
        auto_fixable: false,
        fix_strategy: "Inspect the failing test and the code under test",
        fix_commands: &[],
        verify_commands: &["pytest"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "npm-audit",
        description: "npm audit vulnerability",
        category: Category::Security,
        severity: Severity::High,
        rules: &[
            r"(?i)(?P<message>found \d+ vulnerabilit(?:y|ies) .*\b(?:high|critical)\b.*)",
            r"(?i)(?P<message>\d+ (?:high|critical) severity vulnerabilit(?:y|ies))",
        ],
        auto_fixable: true,
        fix_strategy: "Upgrade vulnerable dependencies within semver ranges with npm audit fix",
        fix_commands: &["npm audit fix"],
        verify_commands: &["npm audit --audit-level=high"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::ChangesMeanSuccess,
    },
    Builtin {
        family: "gitleaks",
        description: "Secret detected in repository",
        category: Category::Security,
        severity: Severity::Critical,
        rules: &[
            r"(?i)(?P<message>leaks? found: \d+)",
            r"^File:\s+(?P<file>\S+)\s*$",
        ],
        auto_fixable: false,
        fix_strategy: "Revoke and rotate the exposed credential, then purge it from history",
        fix_commands: &[],
        verify_commands: &["gitleaks detect"],
        impact: EstimatedImpact::Breaking,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "npm-dependency",
        description: "npm dependency resolution error",
        category: Category::Build,
        severity: Severity::Medium,
        rules: &[
            r"npm ERR! (?P<message>(?:code ERESOLVE|ERESOLVE .*|.*peer dep.*))$",
            r"npm ERR! (?P<message>.*(?:404 Not Found|notarget).*)$",
        ],
        auto_fixable: false,
        fix_strategy: "Align conflicting peer dependency versions",
        fix_commands: &["npm install --legacy-peer-deps"],
        verify_commands: &["npm ci"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "pip-dependency",
        description: "Python dependency resolution error",
        category: Category::Build,
        severity: Severity::Medium,
        rules: &[r"(?P<message>(?:Could not find a version that satisfies|No matching distribution found for).*)"],
        auto_fixable: false,
        fix_strategy: "Pin an available version of the missing requirement",
        fix_commands: &["pip install --upgrade -r requirements.txt"],
        verify_commands: &["pip check"],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "docker",
        description: "Docker build or push error",
        category: Category::Build,
        severity: Severity::High,
        rules: &[
            r"(?i)(?P<message>docker.*\b(?:build|push)\b.*\b(?:error|failed)\b.*)",
            r"^(?P<message>ERROR: failed to solve: .*)$",
        ],
        auto_fixable: false,
        fix_strategy: "Inspect the failing Dockerfile instruction",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "kubernetes",
        description: "Kubernetes deployment error",
        category: Category::Configuration,
        severity: Severity::Critical,
        rules: &[r"(?P<message>Error from server.*)", r"(?i)(?P<message>kubectl.*\b(?:error|failed)\b.*)"],
        auto_fixable: false,
        fix_strategy: "Check the manifest and cluster permissions",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::Breaking,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "workflow-config",
        description: "Invalid CI workflow configuration",
        category: Category::Configuration,
        severity: Severity::Critical,
        rules: &[
            r"(?i)(?P<message>invalid workflow file.*)",
            r"(?i)(?P<message>yaml.*(?:syntax error|mapping values are not allowed).*)",
        ],
        auto_fixable: false,
        fix_strategy: "Fix the workflow definition syntax",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::Breaking,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "permission",
        description: "Permission denied",
        category: Category::Configuration,
        severity: Severity::High,
        rules: &[r"(?i)(?P<message>.*\b(?:permission denied|EACCES|403 Forbidden)\b.*)"],
        auto_fixable: false,
        fix_strategy: "Grant the job the missing permission or token scope",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "timeout",
        description: "Job or step timeout",
        category: Category::Runtime,
        severity: Severity::Medium,
        rules: &[r"(?i)(?P<message>.*\b(?:job|step|action)\b.*\b(?:timed out|exceeded the maximum execution time)\b.*)"],
        auto_fixable: false,
        fix_strategy: "Raise the timeout or speed up the slow step",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: "python-exception",
        description: "Unhandled Python exception",
        category: Category::Runtime,
        severity: Severity::Medium,
        rules: &[r"^(?P<message>[A-Z]\w*(?:Error|Exception): .*)$"],
        auto_fixable: false,
        fix_strategy: "Follow the traceback to the raising frame",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
    Builtin {
        family: CATCH_ALL_FAMILY,
        description: "Unclassified CI error",
        category: Category::Build,
        severity: Severity::Medium,
        rules: &[
            r"(?i)^(?:error|fatal)(?:\[[^\]]*\])?: (?P<message>.*)$",
            r"(?P<message>Process completed with exit code [1-9]\d*\.?)",
        ],
        auto_fixable: false,
        fix_strategy: "Read the surrounding log output to identify the failing tool",
        fix_commands: &[],
        verify_commands: &[],
        impact: EstimatedImpact::ReviewRequired,
        exit_policy: ExitPolicy::Strict,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> PatternLibrary {
        PatternLibrary::builtin().expect("built-in patterns are valid")
    }

    #[test]
    fn test_builtin_library_is_valid_and_catch_all_last() {
        let lib = library();
        assert!(!lib.is_empty());
        assert_eq!(lib.patterns().last().unwrap().family, CATCH_ALL_FAMILY);
    }

    #[test]
    fn test_typescript_rule_extracts_location() {
        let lib = library();
        let (pattern, _, m) = lib
            .classify("app.ts(10,5): error TS2345: type mismatch")
            .unwrap();
        assert_eq!(pattern.family, "typescript");
        assert_eq!(m.file.as_deref(), Some("app.ts"));
        assert_eq!(m.line, Some(10));
        assert_eq!(m.column, Some(5));
        assert_eq!(m.message.as_deref(), Some("TS2345: type mismatch"));
    }

    #[test]
    fn test_first_registered_pattern_wins() {
        // mypy would also accept a `path.py:line:` prefix; flake8 is registered first.
        let lib = library();
        let (pattern, _, _) = lib.classify("src/app.py:3:80: E501 line too long").unwrap();
        assert_eq!(pattern.family, "flake8");

        let (pattern, _, _) = lib.classify("error: could not compile `demo`").unwrap();
        assert_eq!(pattern.family, "rustc");
    }

    #[test]
    fn test_unrelated_line_matches_nothing() {
        assert!(library().classify("Compiling demo v0.1.0").is_none());
        assert!(library().classify("").is_none());
    }

    #[test]
    fn test_auto_fixable_without_command_is_rejected() {
        let spec = PatternSpec {
            family: "custom".into(),
            description: None,
            category: Category::Lint,
            severity: Severity::Low,
            rules: vec!["custom lint".into()],
            auto_fixable: true,
            fix_strategy: None,
            fix_commands: vec![],
            verify_commands: vec![],
            impact: None,
            exit_policy: ExitPolicy::Strict,
        };
        let err = PatternLibrary::new(vec![spec.compile().unwrap()]).unwrap_err();
        assert!(matches!(err, PatternError::MissingFixCommand(_)));
    }

    #[test]
    fn test_pattern_without_rules_is_rejected() {
        let spec = PatternSpec {
            family: "empty".into(),
            description: None,
            category: Category::Build,
            severity: Severity::Low,
            rules: vec![],
            auto_fixable: false,
            fix_strategy: None,
            fix_commands: vec![],
            verify_commands: vec![],
            impact: None,
            exit_policy: ExitPolicy::Strict,
        };
        let err = PatternLibrary::new(vec![spec.compile().unwrap()]).unwrap_err();
        assert!(matches!(err, PatternError::NoRules(_)));
    }

    #[test]
    fn test_custom_patterns_precede_catch_all() {
        let spec = PatternSpec {
            family: "terraform".into(),
            description: Some("Terraform validation error".into()),
            category: Category::Configuration,
            severity: Severity::High,
            rules: vec![r"^Error: (?P<message>Invalid .*)$".into()],
            auto_fixable: false,
            fix_strategy: None,
            fix_commands: vec![],
            verify_commands: vec!["terraform validate".into()],
            impact: None,
            exit_policy: ExitPolicy::Strict,
        };
        let lib = PatternLibrary::with_custom(&[spec]).unwrap();
        let families: Vec<&str> = lib.patterns().iter().map(|p| p.family.as_str()).collect();
        let custom_pos = families.iter().position(|f| *f == "terraform").unwrap();
        assert_eq!(custom_pos + 1, families.len() - 1);

        let (pattern, _, _) = lib.classify("Error: Invalid reference").unwrap();
        assert_eq!(pattern.family, "terraform");
    }

    #[test]
    fn test_invalid_custom_regex_is_reported() {
        let err = MatchRule::new("bad", "(unclosed").unwrap_err();
        assert!(matches!(err, PatternError::InvalidRegex { .. }));
    }

    #[test]
    fn test_duplicate_family_is_rejected() {
        let lib = library();
        let mut patterns = lib.patterns().to_vec();
        patterns.push(patterns[0].clone());
        assert!(matches!(
            PatternLibrary::new(patterns),
            Err(PatternError::DuplicateFamily(_))
        ));
    }
}
