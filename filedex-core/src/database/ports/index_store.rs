use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Category, FileEvent, FileRecord};

/// One mutation inside a [`IndexStore::commit`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Upsert(FileRecord),
    /// Marks a live record as tombstoned. No-op for missing or already
    /// tombstoned rows.
    Tombstone { path: PathBuf, at: DateTime<Utc> },
    AppendEvent(FileEvent),
}

/// Durable file index plus the append-only event log.
///
/// Implementations must report persistence failures as
/// `IndexError::StoreUnavailable` and a missing row as `Ok(None)`, never the
/// other way round.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get(&self, path: &Path) -> Result<Option<FileRecord>>;

    /// Applies every op in a single transaction: readers observe all of them
    /// or none.
    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Physically removes a tombstoned record. Returns `false` when the path
    /// is unknown or still live.
    async fn purge_tombstoned(&self, path: &Path) -> Result<bool>;

    /// Every record, live and tombstoned, newest first by `created_at`.
    async fn list_all(&self) -> Result<Vec<FileRecord>>;

    /// Live records of one category, newest first.
    async fn list_by_category(&self, category: Category) -> Result<Vec<FileRecord>>;

    async fn list_tombstoned(&self) -> Result<Vec<FileRecord>>;

    /// Live records strictly below `dir`.
    async fn list_live_under(&self, dir: &Path) -> Result<Vec<FileRecord>>;

    /// Newest first.
    async fn list_recent_events(&self, limit: u32) -> Result<Vec<FileEvent>>;

    async fn upsert(&self, record: FileRecord) -> Result<()> {
        self.commit(vec![StoreOp::Upsert(record)]).await
    }

    async fn tombstone(&self, path: &Path, at: DateTime<Utc>) -> Result<()> {
        self.commit(vec![StoreOp::Tombstone {
            path: path.to_path_buf(),
            at,
        }])
        .await
    }

    async fn append_event(&self, event: FileEvent) -> Result<()> {
        self.commit(vec![StoreOp::AppendEvent(event)]).await
    }
}
