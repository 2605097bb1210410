use std::env;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A root directory watched recursively for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchTarget {
    root: PathBuf,
}

impl WatchTarget {
    /// Resolves `root` to an absolute path, canonicalised when it exists.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let absolute = if root.is_absolute() {
            root
        } else {
            env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(root)
        };
        let root = std::fs::canonicalize(&absolute).unwrap_or_else(|_| lexical_normalize(&absolute));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

impl From<PathBuf> for WatchTarget {
    fn from(root: PathBuf) -> Self {
        Self::new(root)
    }
}

impl From<&Path> for WatchTarget {
    fn from(root: &Path) -> Self {
        Self::new(root)
    }
}

/// Removes `.` and resolves `..` without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }
    clean
}

/// The index keys records by their UTF-8 path text, so paths that are not
/// valid UTF-8 are never indexed.
pub fn is_indexable_path(path: &Path) -> bool {
    path.to_str().is_some()
}

/// Ignored entries match themselves, anything beneath them, and any sibling
/// sharing their name as a prefix (`index.db` also covers `index.db-wal`).
pub fn is_ignored_path(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|ignored| {
        if path.starts_with(ignored) {
            return true;
        }
        match (ignored.parent(), ignored.file_name(), path.file_name()) {
            (Some(dir), Some(stem), Some(name)) => {
                path.parent() == Some(dir)
                    && name.to_string_lossy().starts_with(&*stem.to_string_lossy())
            }
            _ => false,
        }
    })
}
