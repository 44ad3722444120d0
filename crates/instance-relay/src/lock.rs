//! Named, process-wide exclusive locks.
//!
//! Both locks are advisory exclusive locks on files in the runtime directory. The
//! OS drops a lock when its holder exits, so a crashed leader never blocks the
//! next launch from becoming leader.

use crate::error::{RelayError, Result};
use crate::identity::InstanceIdentity;
use crate::platform;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| RelayError::LockFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
            source: Some(e),
        })
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error().is_some()
        && err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// The exclusive lock whose first acquirer becomes the leader.
#[derive(Debug)]
pub struct LeaderLock {
    file: File,
    path: PathBuf,
    acquired_as_leader: bool,
}

impl LeaderLock {
    /// Try to take the leader lock without waiting.
    ///
    /// Contention is not an error: it yields a lock with
    /// [`acquired_as_leader`](Self::acquired_as_leader) `== false`. Failure to
    /// create the lock object at all is fatal.
    pub fn acquire(runtime_dir: &Path, identity: &InstanceIdentity) -> Result<Self> {
        let path = platform::lock_file_path(runtime_dir, &identity.lock_name());
        let file = open_lock_file(&path)?;

        let acquired_as_leader = match file.try_lock_exclusive() {
            Ok(()) => true,
            Err(e) if is_contended(&e) => false,
            Err(e) => {
                return Err(RelayError::LockFailed {
                    path,
                    message: e.to_string(),
                    source: Some(e),
                })
            }
        };

        debug!(
            "Leader lock {} {}",
            path.display(),
            if acquired_as_leader { "acquired" } else { "held elsewhere" }
        );

        Ok(Self {
            file,
            path,
            acquired_as_leader,
        })
    }

    /// Whether this process won the lock. Fixed at acquisition.
    pub fn acquired_as_leader(&self) -> bool {
        self.acquired_as_leader
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. Only valid for the owner.
    pub fn release(self) -> Result<()> {
        if !self.acquired_as_leader {
            return Err(RelayError::LockNotHeld);
        }
        self.file
            .unlock()
            .map_err(|e| RelayError::io_with_path(e, self.path.clone()))?;
        debug!("Leader lock {} released", self.path.display());
        Ok(())
    }
}

/// Lock serializing mailbox writers. Released on drop.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Block until this process is the only mailbox writer.
    pub fn acquire(runtime_dir: &Path, identity: &InstanceIdentity) -> Result<Self> {
        let path = platform::lock_file_path(runtime_dir, &identity.writer_lock_name());
        let file = open_lock_file(&path)?;
        file.lock_exclusive().map_err(|e| RelayError::LockFailed {
            path: path.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;
        debug!("Writer lock {} acquired", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release writer lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;
    use tempfile::TempDir;

    fn identity() -> InstanceIdentity {
        InstanceIdentity::new(uuid::Uuid::new_v4().to_string()).unwrap()
    }

    #[test]
    fn test_second_acquire_is_follower() {
        let dir = TempDir::new().unwrap();
        let id = identity();

        let first = LeaderLock::acquire(dir.path(), &id).unwrap();
        let second = LeaderLock::acquire(dir.path(), &id).unwrap();

        assert!(first.acquired_as_leader());
        assert!(!second.acquired_as_leader());
    }

    #[test]
    fn test_release_by_follower_is_an_error() {
        let dir = TempDir::new().unwrap();
        let id = identity();

        let _leader = LeaderLock::acquire(dir.path(), &id).unwrap();
        let follower = LeaderLock::acquire(dir.path(), &id).unwrap();

        assert!(matches!(follower.release(), Err(RelayError::LockNotHeld)));
    }

    #[test]
    fn test_release_lets_next_acquire_lead() {
        let dir = TempDir::new().unwrap();
        let id = identity();

        let leader = LeaderLock::acquire(dir.path(), &id).unwrap();
        leader.release().unwrap();

        let next = LeaderLock::acquire(dir.path(), &id).unwrap();
        assert!(next.acquired_as_leader());
    }

    #[test]
    fn test_drop_without_release_frees_lock() {
        let dir = TempDir::new().unwrap();
        let id = identity();

        drop(LeaderLock::acquire(dir.path(), &id).unwrap());
        assert!(LeaderLock::acquire(dir.path(), &id).unwrap().acquired_as_leader());
    }

    #[test]
    fn test_racing_acquirers_elect_exactly_one() {
        let dir = Arc::new(TempDir::new().unwrap());
        let id = identity();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                let id = id.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    LeaderLock::acquire(dir.path(), &id).unwrap()
                })
            })
            .collect();

        // Keep every lock alive until all threads have been counted
        let locks: Vec<LeaderLock> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let leaders = locks.iter().filter(|l| l.acquired_as_leader()).count();
        assert_eq!(leaders, 1);
    }

    #[test]
    fn test_unusable_lock_location_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = LeaderLock::acquire(&missing, &identity());
        assert!(matches!(result, Err(RelayError::LockFailed { .. })));
    }

    #[test]
    fn test_writer_lock_serializes_writers() {
        let dir = Arc::new(TempDir::new().unwrap());
        let id = identity();

        let held = WriterLock::acquire(dir.path(), &id).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let dir = dir.clone();
            let id = id.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _lock = WriterLock::acquire(dir.path(), &id).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "second writer must wait");

        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
