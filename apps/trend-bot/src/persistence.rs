//! Durable JSON state files.
//!
//! State that must survive a restart (circuit breaker records, bot state)
//! lives in small JSON files. Concurrent processes serialize their
//! read-modify-write cycles through an OS advisory lock on a sidecar
//! `<file>.lock`, and every write goes to a temp file in the same directory
//! that is fsynced and atomically renamed over the target, so a reader never
//! observes a partial record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors from state file operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("state file I/O error at '{path}': {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// The underlying IO error.
        source: io::Error,
    },

    /// Failed to serialize the record.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A JSON record on disk guarded by an advisory lock.
#[derive(Debug, Clone)]
pub struct JsonStateFile<T> {
    path: PathBuf,
    lock_path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonStateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a handle for the state file at `path`.
    ///
    /// Nothing is touched on disk until the first load or update.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            _record: PhantomData,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record under a shared lock.
    ///
    /// A missing file yields `T::default()`. An unreadable or corrupt file is
    /// logged and also yields the default, so a damaged record never wedges
    /// the bot.
    pub fn load(&self) -> Result<T, StoreError> {
        let lock = self.open_lock_file()?;
        lock.lock_shared()
            .map_err(|e| StoreError::io(&self.lock_path, e))?;
        let value = self.read_current();
        drop(lock);
        value
    }

    /// Read, mutate and write back the record as one exclusive step.
    ///
    /// The closure's return value is passed through. The new record is
    /// durable before this returns.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let lock = self.open_lock_file()?;
        lock.lock().map_err(|e| StoreError::io(&self.lock_path, e))?;

        let mut value = self.read_current()?;
        let result = mutate(&mut value);
        let bytes = serde_json::to_vec_pretty(&value)?;
        write_atomic(&self.path, &bytes)?;

        drop(lock);
        Ok(result)
    }

    /// Overwrite the record.
    pub fn store(&self, value: &T) -> Result<(), StoreError> {
        let lock = self.open_lock_file()?;
        lock.lock().map_err(|e| StoreError::io(&self.lock_path, e))?;
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&self.path, &bytes)?;
        drop(lock);
        Ok(())
    }

    fn read_current(&self) -> Result<T, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(value),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Corrupt state file, starting from defaults"
                    );
                    Ok(T::default())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    fn open_lock_file(&self) -> Result<File, StoreError> {
        ensure_parent(&self.lock_path)?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| StoreError::io(&self.lock_path, e))
    }
}

/// Atomically replace `path` with `bytes`.
///
/// The data is written to a temp file beside the target, flushed to disk
/// and renamed into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = ensure_parent(path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<PathBuf, StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::<Counter>::new(dir.path().join("counter.json"));

        assert_eq!(file.load().unwrap(), Counter::default());
        assert!(!file.path().exists());
    }

    #[test]
    fn update_persists_and_returns_closure_result() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::<Counter>::new(dir.path().join("counter.json"));

        let previous = file
            .update(|c| {
                let prev = c.value;
                c.value += 1;
                prev
            })
            .unwrap();

        assert_eq!(previous, 0);
        let reopened = JsonStateFile::<Counter>::new(dir.path().join("counter.json"));
        assert_eq!(reopened.load().unwrap().value, 1);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        fs::write(&path, b"{not json").unwrap();

        let file = JsonStateFile::<Counter>::new(&path);
        assert_eq!(file.load().unwrap(), Counter::default());

        file.update(|c| c.value = 7).unwrap();
        assert_eq!(file.load().unwrap().value, 7);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::<Counter>::new(dir.path().join("nested/deeper/counter.json"));

        file.store(&Counter { value: 3 }).unwrap();

        assert_eq!(file.load().unwrap().value, 3);
    }

    #[test]
    fn concurrent_updates_do_not_lose_increments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let file = JsonStateFile::<Counter>::new(path);
                    for _ in 0..25 {
                        file.update(|c| c.value += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let file = JsonStateFile::<Counter>::new(path);
        assert_eq!(file.load().unwrap().value, 200);
    }
}
