//! Advisory exclusive locks on dedicated lock files.
//!
//! Host locks exclude concurrent backup dumps from the host's `refCnt`
//! directory; pool shard locks exclude backups racing the cleaner on the
//! mark/sweep decision. No lock is ever held across another acquisition.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::info;

use crate::error::{CairnError, Result};

/// Handle to an acquired lock; released on drop. The lock file itself is
/// left in place.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Acquire an exclusive lock on `path`, creating the file if needed.
///
/// The first attempt does not block. On contention a diagnostic is logged
/// and the acquisition retries blocking; only a failure of the blocking
/// attempt reports the lock as unavailable.
pub fn acquire(path: &Path) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if file.try_lock_exclusive().is_err() {
        info!("waiting for lock on {}", path.display());
        file.lock_exclusive()
            .map_err(|_| CairnError::LockUnavailable(path.to_path_buf()))?;
    }

    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}
