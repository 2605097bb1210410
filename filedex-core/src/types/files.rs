use std::collections::BTreeMap;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Category;
use crate::classifier::{classify_path, extension_of};

/// Whether an indexed entry still has a filesystem counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Live,
    /// Retained after the target disappeared; shown as trash until purged.
    Tombstoned,
}

impl RecordState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Tombstoned => "tombstoned",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "live" => Ok(Self::Live),
            "tombstoned" => Ok(Self::Tombstoned),
            other => Err(format!("invalid record state: {other}")),
        }
    }
}

/// One row of the file index, keyed by absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub name: String,
    /// Lower-cased with the leading dot, empty when the name has none.
    pub extension: String,
    pub size_bytes: u64,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub state: RecordState,
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Builds a fresh live record from a stat of `path`.
    pub fn from_metadata(path: &Path, metadata: &Metadata, now: DateTime<Utc>) -> Self {
        let is_dir = metadata.is_dir();
        let modified_at = metadata.modified().map(to_utc).unwrap_or(now);
        // Not every platform reports birth time; fall back to mtime like ctime would.
        let created_at = metadata.created().map(to_utc).unwrap_or(modified_at);

        Self {
            path: path.to_path_buf(),
            name: file_name_of(path),
            extension: if is_dir { String::new() } else { extension_of(path) },
            size_bytes: if is_dir { 0 } else { metadata.len() },
            category: if is_dir {
                Category::Folder
            } else {
                classify_path(path)
            },
            created_at,
            modified_at,
            last_accessed_at: now,
            access_count: 1,
            state: RecordState::Live,
            tombstoned_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == RecordState::Live
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state == RecordState::Tombstoned
    }

    pub fn is_folder(&self) -> bool {
        self.category == Category::Folder
    }

    /// True when size and mtime still match `metadata`.
    pub fn matches_metadata(&self, metadata: &Metadata) -> bool {
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let modified = metadata.modified().map(to_utc).ok();
        // Stored timestamps are compared at millisecond precision.
        self.size_bytes == size
            && modified.is_none_or(|m| m.timestamp_millis() == self.modified_at.timestamp_millis())
    }

    /// Refreshes size and mtime from a new stat, keeping identity and counters.
    pub fn refresh_from(&mut self, metadata: &Metadata, now: DateTime<Utc>) {
        self.size_bytes = if metadata.is_dir() { 0 } else { metadata.len() };
        self.modified_at = metadata.modified().map(to_utc).unwrap_or(now);
        self.last_accessed_at = now;
    }

    pub fn tombstone(&mut self, at: DateTime<Utc>) {
        self.state = RecordState::Tombstoned;
        self.tombstoned_at = Some(at);
    }
}

pub(crate) fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Optional narrowing applied by `FileIndex::list_files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    pub category: Option<Category>,
    /// Case-insensitive substring matched against name and path.
    pub text_query: Option<String>,
}

impl FileFilter {
    pub fn category(category: Category) -> Self {
        Self {
            category: Some(category),
            text_query: None,
        }
    }

    pub fn text(query: impl Into<String>) -> Self {
        Self {
            category: None,
            text_query: Some(query.into()),
        }
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        if let Some(category) = self.category
            && record.category != category
        {
            return false;
        }

        match self.text_query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => {
                let needle = query.to_lowercase();
                record.name.to_lowercase().contains(&needle)
                    || record
                        .path
                        .to_string_lossy()
                        .to_lowercase()
                        .contains(&needle)
            }
            _ => true,
        }
    }
}

/// Aggregate view over live records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub counts_by_category: BTreeMap<Category, u64>,
}

impl IndexStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        let mut stats = IndexStats::default();
        for record in records.into_iter().filter(|record| record.is_live()) {
            stats.total_files += 1;
            stats.total_size_bytes += record.size_bytes;
            *stats.counts_by_category.entry(record.category).or_insert(0) += 1;
        }
        stats
    }
}
