//! Per-repository repair lock.
//!
//! The checkpoint is not a lock by itself: two runs against one working tree
//! would stash and reset each other's state. Holding an exclusive advisory
//! lock in the git directory for the whole run serializes them.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = "ci-medic.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another repair run holds {}", .0.display())]
    Held(PathBuf),
    #[error("failed to open lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Released on drop.
#[derive(Debug)]
pub struct RepairLock {
    file: File,
    path: PathBuf,
}

impl RepairLock {
    /// Take the lock without waiting; a held lock is reported, not awaited.
    pub fn acquire(git_dir: &Path) -> Result<Self, LockError> {
        let path = git_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(LockError::Held(path)),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(LockError::Held(path))
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepairLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
