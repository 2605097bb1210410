use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    /// The persistence layer could not be reached or rejected the operation.
    #[error("Index store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stat or removal target vanished.
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// A user write would have replaced an existing entry.
    #[error("Already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A configured root could not be subscribed to.
    #[error("Failed to watch {}: {reason}", path.display())]
    WatchSubscriptionFailed { path: PathBuf, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Maps an I/O failure on `path` onto the error kinds the reconciler
    /// branches on.
    pub fn from_io(source: io::Error, path: &Path) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => IndexError::PathNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => IndexError::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => IndexError::AlreadyExists(path.to_path_buf()),
            _ => IndexError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::PathNotFound(_))
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, IndexError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        IndexError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for IndexError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IndexError::StoreUnavailable(format!("migration failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
