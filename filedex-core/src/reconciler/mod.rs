//! The single writer of the index.
//!
//! Every change, whether it comes from the watcher, the sweep or a user
//! action, goes through [`Reconciler`]. The event kind it is handed is only a
//! hint: each transition re-stats the path and takes the branch matching what
//! is actually on disk.

mod locks;
mod user;

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::spawn_blocking;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::config::ReconcileConfig;
use crate::database::ports::{IndexStore, StoreOp};
use crate::error::{IndexError, Result};
use crate::normalizer::LogicalEvent;
use crate::types::{FileEvent, FileEventKind, FileRecord, IndexChange, is_indexable_path};

use locks::PathLocks;

pub use user::validate_entry_name;

/// What an applied event did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Resurrected,
    Tombstoned,
    Moved,
    Unchanged,
}

/// Per-call switches for [`Reconciler::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Track the path even if it is a directory and directories are not
    /// indexed.
    pub force_track: bool,
    /// Index the contents of a directory that appeared in one step, such as
    /// one moved into a watched root.
    pub descend: bool,
}

impl ApplyOptions {
    pub const WATCH: Self = Self {
        force_track: false,
        descend: true,
    };

    pub const SWEEP: Self = Self {
        force_track: false,
        descend: false,
    };

    pub const USER: Self = Self {
        force_track: true,
        descend: false,
    };
}

pub struct Reconciler {
    store: Arc<dyn IndexStore>,
    locks: PathLocks,
    config: ReconcileConfig,
    changes: broadcast::Sender<IndexChange>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn IndexStore>, config: ReconcileConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        Self {
            store,
            locks: PathLocks::default(),
            config,
            changes,
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexChange> {
        self.changes.subscribe()
    }

    /// Applies one logical event under the per-path lock(s).
    pub async fn apply(
        &self,
        event: &LogicalEvent,
        options: ApplyOptions,
    ) -> Result<ReconcileOutcome> {
        let from = event.from_path.as_deref().filter(|from| is_indexable_path(from));
        if !is_indexable_path(&event.path) {
            warn!(path = %event.path.display(), "skipping path that is not valid UTF-8");
            // Whatever left an indexable source still has to be accounted for.
            return match from {
                Some(from) => {
                    let _guard = self.locks.lock(from).await;
                    self.apply_change(from, FileEventKind::Deleted, options)
                        .await
                }
                None => Ok(ReconcileOutcome::Unchanged),
            };
        }

        match (event.kind, from) {
            (FileEventKind::Moved, Some(from)) => {
                let _guards = self.locks.lock_pair(from, &event.path).await;
                self.apply_move(from, &event.path, options).await
            }
            (kind, _) => {
                let _guard = self.locks.lock(&event.path).await;
                self.apply_change(&event.path, kind, options).await
            }
        }
    }

    /// Applies an event that came from the watcher or a sweep. Store outages
    /// are retried with backoff; anything still failing is logged and the
    /// event is dropped.
    pub async fn apply_passive(
        &self,
        event: &LogicalEvent,
        options: ApplyOptions,
    ) -> Option<ReconcileOutcome> {
        let attempts = self.config.write_retry_attempts.max(1);
        for attempt in 0..attempts {
            match self.apply(event, options).await {
                Ok(outcome) => return Some(outcome),
                Err(err) if err.is_store_unavailable() && attempt + 1 < attempts => {
                    let delay = self.config.retry_backoff(attempt);
                    warn!(
                        path = %event.path.display(),
                        kind = %event.kind,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "index write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        path = %event.path.display(),
                        kind = %event.kind,
                        error = %err,
                        "dropping filesystem event"
                    );
                    return None;
                }
            }
        }
        None
    }

    async fn apply_change(
        &self,
        path: &Path,
        hint: FileEventKind,
        options: ApplyOptions,
    ) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        let existing = self.store.get(path).await?;
        let Some(metadata) = stat(path).await? else {
            // Whatever the hint said, the path is gone.
            return self.tombstone_tree(path, existing, now).await;
        };

        match existing {
            Some(record) if record.is_live() => {
                if record.matches_metadata(&metadata) && hint != FileEventKind::Modified {
                    debug!(path = %path.display(), kind = %hint, "index already current");
                    return Ok(ReconcileOutcome::Unchanged);
                }
                let updated = refreshed(record, path, &metadata, now);
                self.commit(vec![
                    StoreOp::Upsert(updated),
                    StoreOp::AppendEvent(FileEvent::new(FileEventKind::Modified, path, now)),
                ])
                .await?;
                Ok(ReconcileOutcome::Updated)
            }
            prior => {
                let resurrecting = prior.is_some();
                let track = resurrecting
                    || !metadata.is_dir()
                    || options.force_track
                    || self.tracks_directories();

                let mut ops = Vec::new();
                if track {
                    let mut record = FileRecord::from_metadata(path, &metadata, now);
                    if let Some(prior) = prior.as_ref() {
                        record.access_count = prior.access_count.saturating_add(1);
                    }
                    ops.push(StoreOp::Upsert(record));
                    ops.push(StoreOp::AppendEvent(FileEvent::new(
                        FileEventKind::Created,
                        path,
                        now,
                    )));
                }
                if metadata.is_dir() && options.descend {
                    self.index_tree(path, &HashMap::new(), now, &mut ops).await?;
                }

                if ops.is_empty() {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.commit(ops).await?;

                Ok(match (track, resurrecting) {
                    (true, true) => ReconcileOutcome::Resurrected,
                    _ => ReconcileOutcome::Created,
                })
            }
        }
    }

    async fn apply_move(
        &self,
        from: &Path,
        to: &Path,
        options: ApplyOptions,
    ) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        if stat(from).await?.is_some() {
            // Nothing left the source: a copy, a rename that was undone, or a
            // move applied after a later create. Reconcile each end alone.
            debug!(from = %from.display(), to = %to.display(), "move source still on disk");
            let source_only = ApplyOptions {
                descend: false,
                ..options
            };
            self.apply_change(from, FileEventKind::Created, source_only)
                .await?;
            return self.apply_change(to, FileEventKind::Created, options).await;
        }

        let Some(metadata) = stat(to).await? else {
            // The destination vanished again; all that is left is the delete.
            let source = self.store.get(from).await?;
            let outcome = self.tombstone_tree(from, source, now).await?;
            let dest = self.store.get(to).await?;
            self.tombstone_tree(to, dest, now).await?;
            return Ok(outcome);
        };

        let source = self.store.get(from).await?;
        let source_children = self.store.list_live_under(from).await?;
        let source_tracked = source.as_ref().is_some_and(FileRecord::is_live);

        if !source_tracked && source_children.is_empty() {
            // Nothing was known about the source: this is a plain arrival.
            return self.apply_change(to, FileEventKind::Created, options).await;
        }

        let mut ops = Vec::new();
        if source_tracked {
            ops.push(StoreOp::Tombstone {
                path: from.to_path_buf(),
                at: now,
            });
        }
        let mut carried = HashMap::with_capacity(source_children.len());
        for child in source_children {
            ops.push(StoreOp::Tombstone {
                path: child.path.clone(),
                at: now,
            });
            if let Ok(relative) = child.path.strip_prefix(from) {
                carried.insert(to.join(relative), child);
            }
        }

        let track = source_tracked
            || !metadata.is_dir()
            || options.force_track
            || self.tracks_directories();
        if track {
            let mut record = FileRecord::from_metadata(to, &metadata, now);
            match (source.as_ref().filter(|s| s.is_live()), self.store.get(to).await?) {
                (Some(source), _) => inherit(&mut record, source),
                (None, Some(existing)) => {
                    record.access_count = existing.access_count.saturating_add(1)
                }
                (None, None) => {}
            }
            ops.push(StoreOp::Upsert(record));
        }

        if metadata.is_dir() {
            self.index_tree_silently(to, &carried, now, &mut ops).await?;
        }

        ops.push(StoreOp::AppendEvent(FileEvent::moved(from, to, now)));
        self.commit(ops).await?;
        Ok(ReconcileOutcome::Moved)
    }

    /// Tombstones `path` (when live) and every live record below it.
    async fn tombstone_tree(
        &self,
        path: &Path,
        existing: Option<FileRecord>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let ops = self.tombstone_ops(path, existing.as_ref(), now).await?;
        if ops.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.commit(ops).await?;
        Ok(ReconcileOutcome::Tombstoned)
    }

    async fn tombstone_ops(
        &self,
        path: &Path,
        existing: Option<&FileRecord>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoreOp>> {
        let mut targets = Vec::new();
        if existing.is_some_and(FileRecord::is_live) {
            targets.push(path.to_path_buf());
        }
        targets.extend(
            self.store
                .list_live_under(path)
                .await?
                .into_iter()
                .map(|record| record.path),
        );

        let mut ops = Vec::with_capacity(targets.len() * 2);
        for target in targets {
            ops.push(StoreOp::Tombstone {
                path: target.clone(),
                at: now,
            });
            ops.push(StoreOp::AppendEvent(FileEvent::new(
                FileEventKind::Deleted,
                target,
                now,
            )));
        }
        Ok(ops)
    }

    /// Indexes the contents of a directory that appeared in one step, one
    /// `Created` event per new record.
    async fn index_tree(
        &self,
        dir: &Path,
        carried: &HashMap<PathBuf, FileRecord>,
        now: DateTime<Utc>,
        ops: &mut Vec<StoreOp>,
    ) -> Result<()> {
        let before = ops.len();
        self.index_tree_silently(dir, carried, now, ops).await?;
        let created: Vec<PathBuf> = ops[before..]
            .iter()
            .filter_map(|op| match op {
                StoreOp::Upsert(record) => Some(record.path.clone()),
                _ => None,
            })
            .collect();
        ops.extend(
            created
                .into_iter()
                .map(|path| StoreOp::AppendEvent(FileEvent::new(FileEventKind::Created, path, now))),
        );
        Ok(())
    }

    async fn index_tree_silently(
        &self,
        dir: &Path,
        carried: &HashMap<PathBuf, FileRecord>,
        now: DateTime<Utc>,
        ops: &mut Vec<StoreOp>,
    ) -> Result<()> {
        let track_dirs = self.tracks_directories();
        for (path, metadata) in walk_tree(dir).await {
            if metadata.is_dir() && !track_dirs && !carried.contains_key(&path) {
                continue;
            }
            let mut record = FileRecord::from_metadata(&path, &metadata, now);
            if let Some(previous) = carried.get(&path) {
                inherit(&mut record, previous);
            } else {
                match self.store.get(&path).await? {
                    Some(existing) if existing.is_live() => continue,
                    Some(existing) => {
                        record.access_count = existing.access_count.saturating_add(1)
                    }
                    None => {}
                }
            }
            ops.push(StoreOp::Upsert(record));
        }
        Ok(())
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        let changes: Vec<IndexChange> = ops
            .iter()
            .filter_map(|op| match op {
                StoreOp::AppendEvent(event) => Some(IndexChange::from(event)),
                _ => None,
            })
            .collect();

        self.store.commit(ops).await?;

        for change in changes {
            debug!(path = %change.path.display(), kind = %change.kind, "index changed");
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    fn tracks_directories(&self) -> bool {
        self.config.index_directories
    }
}

fn refreshed(
    mut record: FileRecord,
    path: &Path,
    metadata: &Metadata,
    now: DateTime<Utc>,
) -> FileRecord {
    let fresh = FileRecord::from_metadata(path, metadata, now);
    record.refresh_from(metadata, now);
    record.category = fresh.category;
    record.extension = fresh.extension;
    record.access_count = record.access_count.saturating_add(1);
    record
}

/// A moved entry keeps its history.
fn inherit(record: &mut FileRecord, previous: &FileRecord) {
    record.created_at = previous.created_at;
    record.access_count = previous.access_count;
}

/// `Ok(None)` when nothing exists at `path`.
pub(crate) async fn stat(path: &Path) -> Result<Option<Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(IndexError::from_io(err, path)),
    }
}

async fn walk_tree(dir: &Path) -> Vec<(PathBuf, Metadata)> {
    let root = dir.to_path_buf();
    let walked = spawn_blocking(move || {
        WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| is_indexable_path(entry.path()))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                Some((entry.into_path(), metadata))
            })
            .collect::<Vec<_>>()
    })
    .await;

    walked.unwrap_or_else(|err| {
        warn!(dir = %dir.display(), error = %err, "directory walk panicked");
        Vec::new()
    })
}
