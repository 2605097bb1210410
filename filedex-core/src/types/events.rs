use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl FileEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Moved => "moved",
        }
    }
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFileEventKindError {
    invalid_value: String,
}

impl ParseFileEventKindError {
    pub fn new(value: &str) -> Self {
        Self {
            invalid_value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseFileEventKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid file event kind: {}", self.invalid_value)
    }
}

impl std::error::Error for ParseFileEventKindError {}

impl FromStr for FileEventKind {
    type Err = ParseFileEventKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(Self::Created),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            "moved" => Ok(Self::Moved),
            other => Err(ParseFileEventKindError::new(other)),
        }
    }
}

/// Append-only audit entry. Never authoritative for current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Assigned by the store on insert.
    pub id: Option<i64>,
    pub path: PathBuf,
    /// Source path, only set for `Moved`.
    pub from_path: Option<PathBuf>,
    pub kind: FileEventKind,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            path: path.into(),
            from_path: None,
            kind,
            timestamp,
        }
    }

    pub fn moved(
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            path: to.into(),
            from_path: Some(from.into()),
            kind: FileEventKind::Moved,
            timestamp,
        }
    }
}

/// Broadcast to in-process subscribers after a transition commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    pub kind: FileEventKind,
    pub path: PathBuf,
    pub from_path: Option<PathBuf>,
}

impl From<&FileEvent> for IndexChange {
    fn from(event: &FileEvent) -> Self {
        Self {
            kind: event.kind,
            path: event.path.clone(),
            from_path: event.from_path.clone(),
        }
    }
}
