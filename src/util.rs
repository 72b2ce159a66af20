use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Characters a shell would interpret. The step tokenizer rejects them
/// outside quotes, so arguments carrying one must be quoted.
pub const SHELL_METACHARACTERS: &[char] = &['`', '$', ';', '&', '|', '\n', '>', '<'];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cut a message to `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some(_) if max <= 3 => s.chars().take(max).collect(),
        Some(_) => {
            let cut = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
            format!("{}...", &s[..cut])
        }
    }
}

/// Keep the tail of command output, which is where tools print their verdict.
pub fn tail_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(char_count - max).collect();
    format!("… (truncated)\n{}", tail)
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout and stderr joined, stdout first.
    pub fn combined(&self) -> String {
        [self.stdout.trim_end(), self.stderr.trim_end()]
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run one fix, verify or publish command, killing it once `timeout`
/// elapses. `label` names the command in errors.
///
/// A timeout is not an error: the output comes back with `timed_out` set so
/// the caller can count the attempt. Pipes are drained on their own threads
/// so a chatty tool never blocks on a full pipe.
pub fn run_command_with_timeout(
    command: &mut Command,
    label: &str,
    timeout: Duration,
) -> Result<ProcessOutput, String> {
    let start = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start '{}': {}", label, e))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if start.elapsed() >= timeout => {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(format!("Failed to wait for '{}': {}", label, e)),
        }
    };

    Ok(ProcessOutput {
        exit_code: status.and_then(|s| s.code()),
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = BufReader::new(pipe).read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Resolve a repo-relative path, refusing absolute paths and anything that
/// escapes the repository root.
pub fn resolve_repo_file(repo_root: &Path, candidate: &Path) -> Result<PathBuf, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve repo root: {}", e))?;
    let resolved = root
        .join(candidate)
        .canonicalize()
        .map_err(|e| format!("Failed to resolve {}: {}", candidate.display(), e))?;

    if !resolved.starts_with(&root) {
        return Err(format!("Path escapes repository: {}", candidate.display()));
    }
    Ok(resolved)
}

/// Quote one argument so the step tokenizer reads it back as a single
/// literal word.
pub fn quote_arg(arg: &str) -> String {
    let needs_quotes = |c: char| {
        c.is_whitespace() || matches!(c, '\'' | '"' | '\\') || SHELL_METACHARACTERS.contains(&c)
    };
    let plain = !arg.is_empty() && !arg.chars().any(needs_quotes);
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// A file name from a CI log as a command argument. Names starting with `-`
/// get a `./` prefix so no tool reads them as an option.
pub fn path_arg(file: &str) -> String {
    if file.starts_with('-') {
        quote_arg(&format!("./{}", file))
    } else {
        quote_arg(file)
    }
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:016x}", fnv1a(FNV_OFFSET_BASIS, content))
}

/// Hash several fields without ambiguity between `("ab", "c")` and `("a", "bc")`.
pub fn hash_fields(fields: &[&str]) -> String {
    let mut hash = FNV_OFFSET_BASIS;
    for field in fields {
        hash = fnv1a(hash, field.as_bytes());
        hash = fnv1a(hash, &[0x1f]);
    }
    format!("{:016x}", hash)
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(seed: u64, content: &[u8]) -> u64 {
    let mut hash = seed;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Format a duration in minutes as `45m` / `1h 5m`.
pub fn format_minutes(total: u64) -> String {
    match (total / 60, total % 60) {
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}
