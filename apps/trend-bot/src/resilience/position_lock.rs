//! Cross-process lock around order placement.
//!
//! A rebalance reads the position, computes a delta and submits an order.
//! Two overlapping cycles (a retried cron run, a second container) must not
//! both act on the same stale position, so the whole sequence runs under
//! this lock.
//!
//! The lock is a file `<dir>/<name>.lock` holding a JSON [`LockRecord`].
//! Taking or releasing it happens under an OS advisory lock on
//! `<dir>/<name>.lock.guard`, which makes the check-then-create step atomic
//! across processes. A record past its `expires_at` (or one that cannot be
//! parsed) belongs to a crashed holder and is reclaimed with a warning.
//!
//! A live holder calls [`PositionLockGuard::renew`] before acting on what it
//! read. Renewal pushes `expires_at` forward, or fails with
//! [`LockError::Lost`] if another process has already reclaimed the lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{Clock, SystemClock};
use crate::observability;
use crate::persistence::{StoreError, write_atomic};

/// Position lock configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionLockConfig {
    /// Directory holding the lock files.
    pub dir: PathBuf,
    /// Lock name; the file is `<dir>/<name>.lock`.
    pub name: String,
    /// How long a holder may keep the lock before others may reclaim it.
    pub max_hold: Duration,
    /// Delay between acquisition attempts while contended.
    pub poll_interval: Duration,
}

impl PositionLockConfig {
    /// Defaults for `dir`: name `position`, 60s max hold, 100ms polling.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            name: "position".to_string(),
            max_hold: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique token of the current holder.
    pub holder: String,
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lock becomes reclaimable.
    pub expires_at: DateTime<Utc>,
}

/// Position lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held for the whole timeout.
    #[error("timed out after {waited:?} waiting for lock '{}'", path.display())]
    Timeout {
        /// Lock file path.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
    },

    /// Filesystem error.
    #[error("lock file I/O error at '{}': {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// Failed to encode the lock record.
    #[error("failed to serialize lock record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The lock expired and another holder took it over.
    #[error("position lock '{}' is no longer held by {holder}", path.display())]
    Lost {
        /// Lock file path.
        path: PathBuf,
        /// Token of the guard that lost the lock.
        holder: String,
    },

    /// Failed to rewrite the lock record.
    #[error(transparent)]
    Write(#[from] StoreError),
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File-based mutual exclusion for one named resource.
#[derive(Debug, Clone)]
pub struct PositionLock {
    config: PositionLockConfig,
    lock_path: PathBuf,
    guard_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl PositionLock {
    /// Create a lock handle. Nothing is touched on disk until `acquire`.
    #[must_use]
    pub fn new(config: PositionLockConfig) -> Self {
        let lock_path = config.dir.join(format!("{}.lock", config.name));
        let guard_path = config.dir.join(format!("{}.lock.guard", config.name));
        Self {
            config,
            lock_path,
            guard_path,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for expiry decisions.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Result<Option<LockRecord>, LockError> {
        match fs::read(&self.lock_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::io(&self.lock_path, e)),
        }
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn acquire(&self, timeout: Duration) -> Result<PositionLockGuard, LockError> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some(guard) = self.try_acquire()? {
                observability::record_lock_acquired(started.elapsed());
                return Ok(guard);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                observability::record_lock_timeout();
                tracing::warn!(
                    lock = %self.lock_path.display(),
                    waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Timed out waiting for position lock"
                );
                return Err(LockError::Timeout {
                    path: self.lock_path.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Run `operation` while holding the lock.
    ///
    /// The lock is released when `operation` completes, fails or panics.
    /// Only acquisition errors are returned: once `operation` has run, its
    /// value is handed back even if the release fails.
    pub async fn with_lock<T, Fut>(&self, timeout: Duration, operation: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(timeout).await?;
        let value = operation.await;
        if let Err(e) = guard.release() {
            tracing::warn!(
                lock = %self.lock_path.display(),
                error = %e,
                "Failed to release position lock"
            );
        }
        Ok(value)
    }

    /// One non-blocking attempt.
    fn try_acquire(&self) -> Result<Option<PositionLockGuard>, LockError> {
        let _guard = self.lock_guard_file()?;
        let now = self.clock.now();

        match fs::read(&self.lock_path) {
            Ok(bytes) => match serde_json::from_slice::<LockRecord>(&bytes) {
                Ok(record) if record.expires_at > now => return Ok(None),
                Ok(record) => {
                    observability::record_lock_stale_override();
                    tracing::warn!(
                        lock = %self.lock_path.display(),
                        holder = %record.holder,
                        pid = record.pid,
                        expired_at = %record.expires_at.to_rfc3339(),
                        "Reclaiming expired position lock"
                    );
                    self.remove_lock_file()?;
                }
                Err(e) => {
                    observability::record_lock_stale_override();
                    tracing::warn!(
                        lock = %self.lock_path.display(),
                        error = %e,
                        "Reclaiming unreadable position lock"
                    );
                    self.remove_lock_file()?;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::io(&self.lock_path, e)),
        }

        let record = LockRecord {
            holder: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: expiry(now, self.config.max_hold),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(LockError::io(&self.lock_path, e)),
        };
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| LockError::io(&self.lock_path, e))?;

        tracing::debug!(
            lock = %self.lock_path.display(),
            holder = %record.holder,
            "Acquired position lock"
        );
        Ok(Some(PositionLockGuard {
            lock_path: self.lock_path.clone(),
            guard_path: self.guard_path.clone(),
            holder: record.holder,
            max_hold: self.config.max_hold,
            clock: Arc::clone(&self.clock),
            released: false,
        }))
    }

    fn lock_guard_file(&self) -> Result<File, LockError> {
        lock_guard_file(&self.guard_path)
    }

    fn remove_lock_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::io(&self.lock_path, e)),
        }
    }
}

fn expiry(now: DateTime<Utc>, max_hold: Duration) -> DateTime<Utc> {
    let max_hold = chrono::Duration::from_std(max_hold).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(max_hold)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Open the guard file and take an exclusive advisory lock on it.
///
/// The lock is released when the returned file is closed.
fn lock_guard_file(guard_path: &Path) -> Result<File, LockError> {
    if let Some(dir) = guard_path.parent() {
        fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(guard_path)
        .map_err(|e| LockError::io(guard_path, e))?;
    file.lock().map_err(|e| LockError::io(guard_path, e))?;
    Ok(file)
}

/// Proof of lock ownership. Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PositionLockGuard {
    lock_path: PathBuf,
    guard_path: PathBuf,
    holder: String,
    max_hold: Duration,
    clock: Arc<dyn Clock>,
    released: bool,
}

impl PositionLockGuard {
    /// Token identifying this acquisition.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Confirm ownership and extend the lock by another `max_hold`.
    ///
    /// Fails with [`LockError::Lost`] when the record on disk belongs to
    /// someone else (or is gone). A holder that lost the lock must not act
    /// on anything it read while holding it.
    pub fn renew(&self) -> Result<DateTime<Utc>, LockError> {
        let _guard = lock_guard_file(&self.guard_path)?;
        let current = if self.released {
            None
        } else {
            match fs::read(&self.lock_path) {
                Ok(bytes) => serde_json::from_slice::<LockRecord>(&bytes).ok(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(LockError::io(&self.lock_path, e)),
            }
        };

        let Some(mut record) = current.filter(|r| r.holder == self.holder) else {
            tracing::error!(
                lock = %self.lock_path.display(),
                holder = %self.holder,
                "Position lock lost to another holder"
            );
            return Err(LockError::Lost {
                path: self.lock_path.clone(),
                holder: self.holder.clone(),
            });
        };

        record.expires_at = expiry(self.clock.now(), self.max_hold);
        write_atomic(&self.lock_path, &serde_json::to_vec_pretty(&record)?)?;
        tracing::debug!(
            lock = %self.lock_path.display(),
            holder = %self.holder,
            expires_at = %record.expires_at.to_rfc3339(),
            "Renewed position lock"
        );
        Ok(record.expires_at)
    }

    /// Release the lock now and report any filesystem error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    /// Idempotent: only the first call touches the filesystem, and a lock
    /// that has since been reclaimed by another holder is left alone.
    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let _guard = lock_guard_file(&self.guard_path)?;
        let current = match fs::read(&self.lock_path) {
            Ok(bytes) => serde_json::from_slice::<LockRecord>(&bytes).ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LockError::io(&self.lock_path, e)),
        };

        match current {
            Some(record) if record.holder == self.holder => {
                fs::remove_file(&self.lock_path).map_err(|e| LockError::io(&self.lock_path, e))?;
                tracing::debug!(
                    lock = %self.lock_path.display(),
                    holder = %self.holder,
                    "Released position lock"
                );
            }
            _ => tracing::warn!(
                lock = %self.lock_path.display(),
                holder = %self.holder,
                "Position lock was reclaimed by another holder before release"
            ),
        }
        Ok(())
    }
}

impl Drop for PositionLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!(
                lock = %self.lock_path.display(),
                error = %e,
                "Failed to release position lock"
            );
        }
    }
}
