use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::errors::*;

/// How long a blocking acquire waits before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive advisory lock on a `<path>.lock` sentinel next to a guarded
/// file. The lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn sentinel(guarded: &Path) -> PathBuf {
        let mut name = guarded.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Lock the sentinel for `guarded`, waiting at most `timeout`.
    pub fn acquire(guarded: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = Self::sentinel(guarded.as_ref());
        let failed = |reason: String| Error::LockingFailed {
            file: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| failed(e.to_string()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= timeout {
                        return Err(failed(format!(
                            "lock still held after {:.1}s",
                            timeout.as_secs_f64()
                        )));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(failed(e.to_string())),
            }
        }

        tracing::debug!(lock = %path.display(), "acquired lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), "failed to release lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let guarded = dir.path().join("nested/.index");

        let first = FileLock::acquire(&guarded, DEFAULT_LOCK_TIMEOUT).unwrap();
        assert!(first.path().exists());

        let err = FileLock::acquire(&guarded, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::LockingFailed { .. }));

        drop(first);
        assert!(FileLock::acquire(&guarded, Duration::from_millis(100)).is_ok());
    }
}
