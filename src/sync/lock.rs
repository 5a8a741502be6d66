//! Per-charm working copy locks
//!
//! Two layers: an in-process mutex per charm name so worker threads queue
//! without polling, and an advisory `flock` on `<reposdir>/.<charm>.lock`
//! so separate processes sharing a workdir also serialize.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for lock")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Advisory file lock held for the duration of one sync.
///
/// Released when dropped.
#[derive(Debug)]
pub struct CharmLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl CharmLock {
    /// Lock file path for `charm` inside `reposdir`
    pub fn path_for(reposdir: &Path, charm: &str) -> PathBuf {
        reposdir.join(format!(".{}.lock", charm))
    }

    /// Acquire the lock, waiting up to `timeout`
    pub fn acquire(reposdir: &Path, charm: &str, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(reposdir)?;

        let lock_path = Self::path_for(reposdir, charm);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(&lock_path) {
                Ok(lock_file) => {
                    if warned {
                        debug!(
                            charm,
                            waited_secs = start.elapsed().as_secs_f64(),
                            "working copy lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path,
                        lock_file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        warn!(charm, path = %lock_path.display(), "working copy locked by another process, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }

            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for CharmLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// One mutex per charm name, created on first use
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding `charm`'s working copy
    pub fn get(&self, charm: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(charm.to_string()).or_default())
    }
}
