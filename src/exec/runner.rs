//! Allow-listed command runner.
//!
//! Fix and verify commands are plain strings in the plan. They are split into
//! argv here and executed directly, never through a shell, and only when the
//! program is on the allow-list.

use crate::util::{run_command_with_timeout, ProcessOutput, SHELL_METACHARACTERS};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Programs fix and verify steps may invoke.
pub const DEFAULT_ALLOWED_PROGRAMS: &[&str] = &[
    "npx", "npm", "yarn", "pnpm", "node", "eslint", "prettier", "tsc", "jest", "black", "ruff",
    "autopep8", "isort", "flake8", "mypy", "pytest", "python", "python3", "pip", "cargo",
    "rustfmt", "go", "gofmt", "make", "git", "gitleaks",
];

/// `git` is allowed for inspection only; history is changed by the executor itself.
const READ_ONLY_GIT_SUBCOMMANDS: &[&str] = &["diff", "status", "ls-files", "log", "show"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("empty command")]
    Empty,
    #[error("unbalanced quote in command: {0}")]
    UnbalancedQuote(String),
    #[error("shell metacharacter '{ch}' is not allowed: {command}")]
    Metacharacter { ch: char, command: String },
    #[error("program '{0}' is not on the allow-list")]
    NotAllowed(String),
    #[error("program must be a bare name, not a path: {0}")]
    ProgramPath(String),
    #[error("git {0} is not allowed in a fix or verify step")]
    GitSubcommand(String),
    #[error("{0}")]
    Spawn(String),
}

pub trait CommandRunner {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration)
        -> Result<ProcessOutput, RunnerError>;
}

/// Split a command line into argv. Single quotes are literal, double quotes
/// allow `\"` and `\\`, a bare backslash escapes the next character.
pub fn tokenize(command: &str) -> Result<Vec<String>, RunnerError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(RunnerError::UnbalancedQuote(command.to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some(ch) if ch == '$' || ch == '`' => {
                            return Err(RunnerError::Metacharacter {
                                ch,
                                command: command.to_string(),
                            })
                        }
                        Some(ch) => current.push(ch),
                        None => return Err(RunnerError::UnbalancedQuote(command.to_string())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ch if SHELL_METACHARACTERS.contains(&ch) => {
                return Err(RunnerError::Metacharacter {
                    ch,
                    command: command.to_string(),
                });
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            ch => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        args.push(current);
    }

    if args.is_empty() {
        return Err(RunnerError::Empty);
    }
    Ok(args)
}

pub struct SystemRunner {
    allowed: BTreeSet<String>,
}

impl SystemRunner {
    pub fn new(extra_programs: &[String]) -> Self {
        let allowed = DEFAULT_ALLOWED_PROGRAMS
            .iter()
            .map(|p| p.to_string())
            .chain(extra_programs.iter().cloned())
            .collect();
        Self { allowed }
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(program)
    }

    /// Tokenize and check a command without running it.
    pub fn validate(&self, command: &str) -> Result<Vec<String>, RunnerError> {
        let argv = tokenize(command)?;
        let program = &argv[0];
        if program.contains('/') || program.contains('\\') {
            return Err(RunnerError::ProgramPath(program.clone()));
        }
        if !self.is_allowed(program) {
            return Err(RunnerError::NotAllowed(program.clone()));
        }
        if program == "git" {
            let sub = argv.get(1).map(String::as_str).unwrap_or("");
            if !READ_ONLY_GIT_SUBCOMMANDS.contains(&sub) {
                return Err(RunnerError::GitSubcommand(sub.to_string()));
            }
        }
        Ok(argv)
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        let argv = self.validate(command)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("CI", "true");

        run_command_with_timeout(&mut cmd, command, timeout).map_err(RunnerError::Spawn)
    }
}
