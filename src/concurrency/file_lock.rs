//! Cross-process advisory file lock (fs2 flock).
//!
//! Serializes audit segment writes, rotation and retention across every
//! process that shares an audit directory, so lines from two writers are
//! never interleaved and a segment is never deleted mid-append.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory lock backed by a dedicated lock file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileLock {
    /// Lock on `path`. The parent directory is created if missing.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking acquire. Waits until the lock is available.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        let file = self.open()?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;
        Ok(FileLockGuard { file })
    }

    /// Non-blocking acquire. Returns `None` if another holder has it.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLockGuard { file })),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // Never truncates: the lock file is shared with other holders.
    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn creates_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = FileLock::new(tmp.path().join("nested/dir/audit.lock")).unwrap();
        let _guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("audit.lock");

        let file = File::create(&lock_path).unwrap();
        file.lock_exclusive().unwrap();

        let lock = FileLock::new(&lock_path).unwrap();
        assert!(lock.try_acquire().unwrap().is_none());

        file.unlock().unwrap();
        drop(file);

        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn guard_drop_releases_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = FileLock::new(tmp.path().join("audit.lock")).unwrap();
        {
            let _guard = lock.acquire().unwrap();
        }
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn concurrent_threads_serialize() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = FileLock::new(tmp.path().join("audit.lock")).unwrap();
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let _guard = lock.acquire().unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
