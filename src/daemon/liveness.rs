//! Per-process liveness tokens.
//!
//! A token is a file held under an exclusive `flock`. The kernel releases
//! the lock when the owning process dies, however it dies, so the daemon
//! can probe liveness with a non-blocking lock attempt: if the lock can
//! be taken, the owner is gone.

use crate::error::{Error, Result};
use rustix::fs::{FlockOperation, flock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// An exclusively locked token file, held for the process lifetime.
pub struct LivenessToken {
    file: File,
    path: PathBuf,
}

impl LivenessToken {
    /// Acquire the token for `runtime` under `dir`, creating the file if
    /// needed.
    ///
    /// Fails with [`Error::InvalidState`] if another live process already
    /// holds the token (duplicate runtime name).
    pub fn acquire(dir: &Path, runtime: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("axon-{runtime}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "liveness token acquired");
                Ok(Self { file, path })
            }
            Err(rustix::io::Errno::WOULDBLOCK) => Err(Error::InvalidState(format!(
                "liveness token for runtime '{}' is held by a live process",
                runtime
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the token file, as registered with the daemon.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LivenessToken {
    fn drop(&mut self) {
        // Unlock before unlink so a racing probe sees a consistent state.
        let _ = flock(&self.file, FlockOperation::Unlock);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Probe whether the process owning the token at `path` is still alive.
///
/// A missing file or a takeable lock both mean the owner is gone.
pub fn is_process_alive(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match flock(&file, FlockOperation::NonBlockingLockExclusive) {
        // We took the lock: the owner died. Dropping the file releases it.
        Ok(()) => false,
        Err(rustix::io::Errno::WOULDBLOCK) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "liveness probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("axon-liveness-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_acquire_and_probe_alive() {
        let dir = test_dir("alive");
        let token = LivenessToken::acquire(&dir, "vision").unwrap();
        assert!(is_process_alive(token.path()));
    }

    #[test]
    fn test_probe_after_release() {
        let dir = test_dir("released");
        let path = {
            let token = LivenessToken::acquire(&dir, "vision").unwrap();
            token.path().to_path_buf()
        };
        assert!(!is_process_alive(&path));
    }

    #[test]
    fn test_probe_missing_token() {
        let dir = test_dir("missing");
        assert!(!is_process_alive(&dir.join("axon-nobody.lock")));
    }

    #[test]
    fn test_duplicate_acquire_fails() {
        let dir = test_dir("dup");
        let _token = LivenessToken::acquire(&dir, "vision").unwrap();
        assert!(matches!(
            LivenessToken::acquire(&dir, "vision"),
            Err(Error::InvalidState(_))
        ));
    }
}
