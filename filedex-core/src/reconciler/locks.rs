use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per path. Entries are dropped again once the last
/// holder or waiter releases them.
#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    inner: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub(crate) async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let mutex = self
            .inner
            .entry(path.to_path_buf())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Locks two paths in a fixed order so concurrent moves cannot deadlock.
    pub(crate) async fn lock_pair(&self, a: &Path, b: &Path) -> Vec<PathGuard<'_>> {
        if a == b {
            return vec![self.lock(a).await];
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        vec![first, second]
    }

    /// Locks every path in the same sorted order [`PathLocks::lock_pair`]
    /// uses, so it never deadlocks against a concurrent move.
    pub(crate) async fn lock_many(&self, mut paths: Vec<PathBuf>) -> Vec<PathGuard<'_>> {
        paths.sort();
        paths.dedup();
        let mut guards = Vec::with_capacity(paths.len());
        for path in &paths {
            guards.push(self.lock(path).await);
        }
        guards
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

pub(crate) struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .inner
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
