//! File-based locking for single-writer safety.
//!
//! Cross-platform (fs2) advisory lock around the path-based constructors:
//! one exclusive writer per map name. Channel-based constructors take no
//! lock, there the caller owns the channels.
//!
//! Lock file path: <root>/<name>.LOCK
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE_SUFFIX;

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}{}", name, LOCK_FILE_SUFFIX))
}

fn open_lock_file(root: &Path, name: &str) -> Result<std::fs::File> {
    let path = lock_file_path(root, name);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok(f)
}

/// Acquire the exclusive lock for a map name. Blocks until acquired.
pub fn acquire_exclusive_lock(root: &Path, name: &str) -> Result<LockGuard> {
    let file = open_lock_file(root, name)?;
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", lock_file_path(root, name).display()))?;
    Ok(LockGuard {
        file,
        path: lock_file_path(root, name),
    })
}

/// Try to acquire the exclusive lock. Returns Err if already locked.
pub fn try_acquire_exclusive_lock(root: &Path, name: &str) -> Result<LockGuard> {
    let file = open_lock_file(root, name)?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "try_lock_exclusive failed: {}",
            lock_file_path(root, name).display()
        )
    })?;
    Ok(LockGuard {
        file,
        path: lock_file_path(root, name),
    })
}
