//! Per-backing-path reader/writer locks
//!
//! Reads hold the shared side and every load-transform-store sequence holds
//! the exclusive side, so concurrent writers cannot lose updates and readers
//! never see a half-written file.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry of locks keyed by backing path
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<RwLock<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.get(path) {
            return lock.clone();
        }
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Run `f` holding the shared lock for `path`
    pub fn with_read<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(path);
        let result = {
            let _guard = lock.read();
            f()
        };
        drop(lock);
        self.forget(path);
        result
    }

    /// Run `f` holding the exclusive lock for `path`
    pub fn with_write<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(path);
        let result = {
            let _guard = lock.write();
            f()
        };
        drop(lock);
        self.forget(path);
        result
    }

    /// Run `f` holding the exclusive locks for both `a` and `b`
    ///
    /// The two locks are always taken in path order, so two callers naming
    /// the same pair cannot deadlock.
    pub fn with_write_pair<R>(&self, a: &Path, b: &Path, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.with_write(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };

        let first_lock = self.lock_for(first);
        let second_lock = self.lock_for(second);
        let result = {
            let _first = first_lock.write();
            let _second = second_lock.write();
            f()
        };
        drop(first_lock);
        drop(second_lock);
        self.forget(first);
        self.forget(second);
        result
    }

    /// Drop the entry for `path` if nobody holds or waits on it
    pub fn forget(&self, path: &Path) {
        self.locks
            .remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of tracked paths
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
