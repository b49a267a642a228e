//! Per-destination advisory locking.
//!
//! Each cache destination `<name>` is guarded by a sibling `<name>.lock`
//! file held with an exclusive `flock`. Unrelated destinations never
//! contend with each other.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::AssemblyError;

/// RAII guard: removes the lock file, then unlocks, on drop.
#[derive(Debug)]
pub struct ScopedLock {
    file: File,
    path: PathBuf,
}

impl ScopedLock {
    /// Block until the exclusive lock on `path` is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }

        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(|source| AssemblyError::Lock {
                    path: path.to_path_buf(),
                    source,
                })?;

            FileExt::lock_exclusive(&file).map_err(|source| AssemblyError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

            // The previous holder unlinks the lock file before unlocking. A lock
            // won on that orphaned inode excludes nobody, so reopen by path.
            if is_same_file(&file, path) {
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }
            debug!(lock = %path.display(), "lock file replaced while waiting, retrying");
        }
    }

    /// Lock scoped to a single cache destination (`<dest>.lock`).
    pub fn for_destination(dest: &Path) -> Result<Self> {
        Self::acquire(&sibling_path(dest, "lock"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

/// `<path>.<suffix>`, keeping any existing extension.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}
