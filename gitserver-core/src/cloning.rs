use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Repository directories that an out-of-band clone is currently populating.
///
/// Cheap to clone; all clones share one set. The lock is only ever held for a
/// single set operation.
#[derive(Clone, Debug, Default)]
pub struct CloneRegistry {
    cloning: Arc<Mutex<HashSet<PathBuf>>>,
}

impl CloneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked.
        self.cloning.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.lock().contains(dir)
    }

    /// Returns `false` if `dir` was already registered.
    pub fn insert(&self, dir: &Path) -> bool {
        self.lock().insert(dir.to_owned())
    }

    /// Returns `false` if `dir` was not registered.
    pub fn remove(&self, dir: &Path) -> bool {
        self.lock().remove(dir)
    }

    /// Register `dir` for the lifetime of the returned guard, or `None` if a
    /// clone of `dir` is already running.
    pub fn start(&self, dir: &Path) -> Option<CloneGuard> {
        if !self.insert(dir) {
            return None;
        }

        tracing::debug!(dir = %dir.display(), "clone started");
        Some(CloneGuard {
            registry: self.clone(),
            dir: dir.to_owned(),
        })
    }
}

#[derive(Debug)]
pub struct CloneGuard {
    registry: CloneRegistry,
    dir: PathBuf,
}

impl CloneGuard {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.dir);
        tracing::debug!(dir = %self.dir.display(), "clone finished");
    }
}
