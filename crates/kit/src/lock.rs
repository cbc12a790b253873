//! Advisory file locks serializing mutations of one machine.

use std::fs::{File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context, Result};
use tracing::trace;

/// An exclusive lock held until dropped.
///
/// Locks are per open file, so acquiring the same path twice from one
/// process blocks; only the outermost operation should take it.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: Utf8PathBuf,
}

impl FileLock {
    /// Block until the lock at `path` is held, creating the file if needed.
    pub(crate) fn acquire(path: &Utf8Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Opening lock file {path}"))?;
        lock_exclusive(&file).with_context(|| format!("Locking {path}"))?;
        trace!("Acquired {path}");
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {e}", self.path);
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(f: &File) -> std::io::Result<()> {
    rustix::fs::flock(f, rustix::fs::FlockOperation::LockExclusive)?;
    Ok(())
}

#[cfg(unix)]
fn unlock(f: &File) -> std::io::Result<()> {
    rustix::fs::flock(f, rustix::fs::FlockOperation::Unlock)?;
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(f: &File) -> std::io::Result<()> {
    f.lock()
}

#[cfg(not(unix))]
fn unlock(f: &File) -> std::io::Result<()> {
    f.unlock()
}
