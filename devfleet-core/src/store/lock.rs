//! Re-entrant advisory file lock.
//!
//! A [`FileLock`] combines a process-local re-entrant mutex with an
//! exclusive `flock` on a colocated lock file. The mutex serializes threads
//! sharing one handle (and lets the holding thread nest acquisitions); the
//! file lock serializes separate handles and separate processes.

use std::{
    cell::RefCell,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace};

use crate::error::StoreError;

#[derive(Debug, Default)]
struct Held {
    depth: usize,
    file: Option<File>,
}

pub struct FileLock {
    path: PathBuf,
    timeout: Option<Duration>,
    poll: Duration,
    held: ReentrantMutex<RefCell<Held>>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("poll", &self.poll)
            .finish()
    }
}

impl FileLock {
    /// `timeout` of `None` waits forever.
    pub fn new(
        path: impl Into<PathBuf>,
        timeout: Option<Duration>,
        poll: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            timeout,
            poll,
            held: ReentrantMutex::new(RefCell::new(Held::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Same lock file with a different timeout. The returned handle does not
    /// share re-entrancy with `self`.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self::new(self.path.clone(), timeout, self.poll)
    }

    /// Whether the current thread holds this handle.
    pub fn is_held(&self) -> bool {
        self.held
            .try_lock()
            .map(|held| held.borrow().depth > 0)
            .unwrap_or(false)
    }

    /// Acquire the lock, blocking up to the configured timeout. The lock is
    /// released when the outermost guard drops.
    pub fn acquire(&self) -> Result<LockGuard<'_>, StoreError> {
        let started = Instant::now();
        let local = match self.timeout {
            None => self.held.lock(),
            Some(timeout) => {
                self.held.try_lock_for(timeout).ok_or_else(|| {
                    StoreError::LockTimeout {
                        path: self.path.clone(),
                        waited: started.elapsed(),
                    }
                })?
            }
        };

        {
            let mut held = local.borrow_mut();
            if held.depth == 0 {
                held.file = Some(self.lock_file(started)?);
            }
            held.depth += 1;
            trace!(path = %self.path.display(), depth = held.depth, "lock acquired");
        }

        Ok(LockGuard { lock: local })
    }

    fn lock_file(&self, started: Instant) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        let contended = fs2::lock_contended_error().raw_os_error();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.raw_os_error() == contended =>
                {
                    let waited = started.elapsed();
                    if let Some(timeout) = self.timeout
                        && waited >= timeout
                    {
                        return Err(StoreError::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    if !announced {
                        debug!(path = %self.path.display(), "waiting for lock");
                        announced = true;
                    }
                    thread::sleep(self.poll);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Scoped hold on a [`FileLock`].
pub struct LockGuard<'a> {
    lock: ReentrantMutexGuard<'a, RefCell<Held>>,
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("depth", &self.lock.borrow().depth)
            .finish()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.lock.borrow_mut();
        held.depth = held.depth.saturating_sub(1);
        if held.depth == 0
            && let Some(file) = held.file.take()
        {
            let _ = FileExt::unlock(&file);
        }
    }
}
