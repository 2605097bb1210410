//! Startup reconciliation: diff the persisted index against the live
//! filesystem so changes made while nothing was watching are not lost.
//!
//! The same sweep backs overflow resyncs and the `sweep` command.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SweepConfig;
use crate::database::ports::IndexStore;
use crate::error::Result;
use crate::normalizer::LogicalEvent;
use crate::reconciler::{ApplyOptions, ReconcileOutcome, Reconciler, stat};
use crate::types::{FileEventKind, FileRecord, WatchTarget, is_ignored_path, is_indexable_path};

/// Counts of what a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Live records whose path was gone.
    pub tombstoned: u64,
    /// Entries that were untracked or tombstoned and now are live.
    pub created: u64,
    /// Live entries whose size or mtime drifted.
    pub modified: u64,
    /// Filesystem entries visited.
    pub scanned: u64,
    /// The entry limit or the timeout cut the sweep short.
    pub truncated: bool,
}

impl SweepReport {
    pub fn changes(&self) -> u64 {
        self.tombstoned + self.created + self.modified
    }
}

#[derive(Debug)]
pub struct StartupSweep {
    reconciler: Arc<Reconciler>,
    targets: Vec<WatchTarget>,
    config: SweepConfig,
    ignored: Vec<PathBuf>,
}

impl StartupSweep {
    pub fn new(reconciler: Arc<Reconciler>, targets: Vec<WatchTarget>, config: SweepConfig) -> Self {
        Self {
            reconciler,
            targets,
            config,
            ignored: Vec::new(),
        }
    }

    /// Excludes `path` (and its sidecar files) from the walk.
    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored.push(path.into());
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Runs one full pass: tombstone what vanished, then walk every existing
    /// target and create or refresh what differs.
    pub async fn run(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut report = SweepReport::default();

        let known: HashMap<PathBuf, FileRecord> = self
            .reconciler
            .store()
            .list_all()
            .await?
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect();

        for record in known.values().filter(|record| record.is_live()) {
            if Instant::now() >= deadline {
                report.truncated = true;
                break;
            }
            match stat(&record.path).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let event = LogicalEvent::new(FileEventKind::Deleted, record.path.clone());
                    if self.apply(&event).await == Some(ReconcileOutcome::Tombstoned) {
                        report.tombstoned += 1;
                    }
                }
                Err(err) => {
                    debug!(path = %record.path.display(), error = %err, "cannot stat indexed path");
                }
            }
        }

        let track_dirs = self.reconciler.config().index_directories;
        for target in &self.targets {
            if report.truncated {
                break;
            }
            if !target.exists() {
                warn!(root = %target, "watch target missing, skipping sweep");
                continue;
            }

            let budget = self
                .config
                .max_entries
                .saturating_sub(report.scanned as usize);
            let walk = walk_target(target, &self.ignored, budget, deadline).await;
            report.scanned += walk.entries.len() as u64;
            report.truncated |= walk.truncated;

            for (path, metadata) in walk.entries {
                if Instant::now() >= deadline {
                    report.truncated = true;
                    break;
                }

                let existing = known.get(&path);
                if metadata.is_dir() && !track_dirs && existing.is_none() {
                    continue;
                }

                let kind = match existing {
                    Some(record) if record.is_live() => {
                        if record.matches_metadata(&metadata) {
                            continue;
                        }
                        FileEventKind::Modified
                    }
                    _ => FileEventKind::Created,
                };

                match self.apply(&LogicalEvent::new(kind, path)).await {
                    Some(ReconcileOutcome::Created | ReconcileOutcome::Resurrected) => {
                        report.created += 1
                    }
                    Some(ReconcileOutcome::Updated) => report.modified += 1,
                    Some(ReconcileOutcome::Tombstoned) => report.tombstoned += 1,
                    _ => {}
                }
            }
        }

        info!(
            tombstoned = report.tombstoned,
            created = report.created,
            modified = report.modified,
            scanned = report.scanned,
            truncated = report.truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        Ok(report)
    }

    async fn apply(&self, event: &LogicalEvent) -> Option<ReconcileOutcome> {
        self.reconciler
            .apply_passive(event, ApplyOptions::SWEEP)
            .await
    }
}

struct TargetWalk {
    entries: Vec<(PathBuf, Metadata)>,
    truncated: bool,
}

async fn walk_target(
    target: &WatchTarget,
    ignored: &[PathBuf],
    budget: usize,
    deadline: Instant,
) -> TargetWalk {
    let root = target.root().to_path_buf();
    let ignored = ignored.to_vec();
    let walked = spawn_blocking(move || {
        let mut entries = Vec::new();
        let mut truncated = false;
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let path = entry.path();
                if !is_indexable_path(path) {
                    warn!(path = %path.display(), "skipping path that is not valid UTF-8");
                    return false;
                }
                !is_ignored_path(path, &ignored)
            });
        for entry in walker {
            if entries.len() >= budget || Instant::now() >= deadline {
                truncated = true;
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if let Ok(metadata) = entry.metadata() {
                entries.push((entry.into_path(), metadata));
            }
        }
        TargetWalk { entries, truncated }
    })
    .await;

    walked.unwrap_or_else(|err| {
        warn!(root = %target, error = %err, "sweep walk panicked");
        TargetWalk {
            entries: Vec::new(),
            truncated: true,
        }
    })
}
