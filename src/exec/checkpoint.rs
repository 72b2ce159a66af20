//! Git checkpoint, rollback and commit operations
//!
//! A checkpoint records HEAD and stashes any pre-existing work (untracked files
//! included) so fixes run against a clean tree. Rollback resets to the recorded
//! revision, removes untracked leftovers and re-applies the stash, which leaves
//! the repository exactly as it was before the run.

use crate::util::{hash_bytes, hash_fields};
use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{
    ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature, StashApplyOptions,
    StashFlags, StatusOptions,
};
use std::fs;
use std::path::{Path, PathBuf};

const FALLBACK_AUTHOR_NAME: &str = "ci-medic";
const FALLBACK_AUTHOR_EMAIL: &str = "ci-medic@localhost";

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub head: Oid,
    /// Branch checked out when the checkpoint was taken; `None` when detached.
    pub branch: Option<String>,
    /// Stash commit holding pre-existing uncommitted work.
    pub stash: Option<Oid>,
    /// Working-tree fingerprint right after stashing.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

pub fn git_dir(repo_path: &Path) -> Result<PathBuf> {
    let repo = open_repo_discover(repo_path)?;
    Ok(repo.path().to_path_buf())
}

pub fn workdir(repo_path: &Path) -> Result<PathBuf> {
    let repo = open_repo_discover(repo_path)?;
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("Repository at '{}' is bare", repo_path.display()))
}

/// Current branch name, or `None` for a detached HEAD.
pub fn current_branch(repo_path: &Path) -> Result<Option<String>> {
    let repo = open_repo_discover(repo_path)?;
    let head = match repo.head() {
        Ok(head) => head,
        Err(err) if err.code() == ErrorCode::UnbornBranch => {
            // Fresh repository: HEAD still names the branch it will create.
            let head = repo.find_reference("HEAD")?;
            return Ok(head
                .symbolic_target()
                .and_then(|t| t.strip_prefix("refs/heads/"))
                .map(str::to_string));
        }
        Err(err) => return Err(err).context("Failed to get HEAD"),
    };
    if !head.is_branch() {
        return Ok(None);
    }
    Ok(head.shorthand().map(str::to_string))
}

fn status_options() -> StatusOptions {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    opts
}

/// Stable hash of every changed path, its status and its current content.
pub fn fingerprint(repo_path: &Path) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;
    let root = repo
        .workdir()
        .ok_or_else(|| anyhow::anyhow!("Repository is bare"))?
        .to_path_buf();
    let statuses = repo
        .statuses(Some(&mut status_options()))
        .context("Failed to read working tree status")?;

    let mut entries: Vec<(String, u32, String)> = statuses
        .iter()
        .map(|entry| {
            let path = entry.path().unwrap_or("").to_string();
            let content = fs::read(root.join(&path))
                .map(|bytes| hash_bytes(&bytes))
                .unwrap_or_else(|_| "-".to_string());
            (path, entry.status().bits(), content)
        })
        .collect();
    entries.sort();

    let rendered: Vec<String> = entries
        .iter()
        .map(|(path, bits, content)| format!("{}:{}:{}", path, bits, content))
        .collect();
    let fields: Vec<&str> = rendered.iter().map(String::as_str).collect();
    Ok(hash_fields(&fields))
}

/// Record HEAD and stash uncommitted work so the tree is clean.
pub fn create(repo_path: &Path, label: &str) -> Result<Checkpoint> {
    let mut repo = open_repo_discover(repo_path)?;
    let head = repo
        .head()
        .context("Repository has no commits to checkpoint")?
        .peel_to_commit()
        .context("Failed to resolve HEAD commit")?
        .id();
    let branch = current_branch(repo_path)?;

    let dirty = !repo.statuses(Some(&mut status_options()))?.is_empty();
    let stash = if dirty {
        let sig = signature(&repo, None)?;
        let message = format!("ci-medic checkpoint {}", label);
        let oid = repo
            .stash_save(&sig, &message, Some(StashFlags::INCLUDE_UNTRACKED))
            .context("Failed to stash uncommitted changes")?;
        Some(oid)
    } else {
        None
    };
    drop(repo);

    Ok(Checkpoint {
        head,
        branch,
        stash,
        fingerprint: fingerprint(repo_path)?,
    })
}

/// True when the working tree or HEAD moved away from the checkpoint.
pub fn has_changes_since(repo_path: &Path, checkpoint: &Checkpoint) -> Result<bool> {
    let repo = open_repo_discover(repo_path)?;
    let head = repo.head()?.peel_to_commit()?.id();
    Ok(head != checkpoint.head || fingerprint(repo_path)? != checkpoint.fingerprint)
}

/// Paths changed in the working tree, for logs and summaries.
pub fn changed_paths(repo_path: &Path) -> Result<Vec<String>> {
    let repo = open_repo_discover(repo_path)?;
    let statuses = repo.statuses(Some(&mut status_options()))?;
    Ok(statuses
        .iter()
        .filter_map(|entry| entry.path().map(str::to_string))
        .collect())
}

/// Restore the checkpoint exactly: revision, tracked files, untracked files
/// and the stashed pre-existing work.
pub fn rollback(repo_path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    {
        let repo = open_repo_discover(repo_path)?;
        if let Some(branch) = &checkpoint.branch {
            if current_branch(repo_path)?.as_deref() != Some(branch.as_str()) {
                repo.set_head(&format!("refs/heads/{}", branch))
                    .with_context(|| format!("Failed to switch back to '{}'", branch))?;
            }
        } else {
            repo.set_head_detached(checkpoint.head)?;
        }

        let target = repo
            .find_object(checkpoint.head, None)
            .context("Checkpoint revision no longer exists")?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(&target, ResetType::Hard, Some(&mut checkout))
            .context("Failed to reset to checkpoint")?;

        remove_untracked(&repo)?;
    }

    if let Some(stash) = checkpoint.stash {
        restore_stash(repo_path, stash)?;
    }
    Ok(())
}

/// Equivalent of `git clean -fd`: ignored files are left alone.
fn remove_untracked(repo: &Repository) -> Result<()> {
    let root = repo
        .workdir()
        .ok_or_else(|| anyhow::anyhow!("Repository is bare"))?;
    let statuses = repo.statuses(Some(&mut status_options()))?;

    for entry in statuses.iter().filter(|e| e.status().is_wt_new()) {
        let Some(rel) = entry.path() else {
            continue;
        };
        let path = root.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to remove untracked '{}'", rel))?;

        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == root || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
    }
    Ok(())
}

/// Pop a specific stash entry, restoring its index state too.
pub fn restore_stash(repo_path: &Path, stash: Oid) -> Result<()> {
    let mut repo = open_repo_discover(repo_path)?;

    let mut position = None;
    repo.stash_foreach(|index, _message, oid| {
        if *oid == stash {
            position = Some(index);
            false
        } else {
            true
        }
    })?;
    let index = position
        .ok_or_else(|| anyhow::anyhow!("Checkpoint stash {} is no longer in the stash list", stash))?;

    let mut opts = StashApplyOptions::new();
    opts.reinstantiate_index();
    repo.stash_pop(index, Some(&mut opts))
        .context("Failed to re-apply stashed changes")?;
    Ok(())
}

/// Stage every change, deletions included.
pub fn stage_all(repo_path: &Path) -> Result<()> {
    let repo = open_repo_discover(repo_path)?;
    let mut index = repo.index()?;

    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    Ok(())
}

fn signature(repo: &Repository, author: Option<&CommitAuthor>) -> Result<Signature<'static>> {
    if let Some(author) = author {
        return Ok(Signature::now(&author.name, &author.email)?);
    }
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| FALLBACK_AUTHOR_NAME.to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| FALLBACK_AUTHOR_EMAIL.to_string());
    Ok(Signature::now(&name, &email)?)
}

/// Commit the index on top of HEAD.
pub fn commit(repo_path: &Path, message: &str, author: Option<&CommitAuthor>) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo
        .head()
        .context("Failed to get HEAD")?
        .peel_to_commit()?;

    let sig = signature(&repo, author)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

    Ok(oid.to_string())
}
