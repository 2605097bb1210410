//! [`FileIndex`]: the handle consumers hold.
//!
//! It owns the store, the reconciler, the sweep and the watch service. Reads
//! go straight to the store and degrade to empty results when the store is
//! unavailable; every mutation goes through the reconciler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::classifier::classify_path;
use crate::config::IndexSettings;
use crate::database::{IndexStore, SqliteIndexStore};
use crate::error::{IndexError, Result};
use crate::fs_watch::{FsWatchService, WatchHandle};
use crate::reconciler::{Reconciler, stat};
use crate::sweep::{StartupSweep, SweepReport};
use crate::types::{
    Category, FileEvent, FileFilter, FileRecord, IndexChange, IndexStats, WatchTarget,
    lexical_normalize,
};

pub struct FileIndex {
    store: Arc<dyn IndexStore>,
    reconciler: Arc<Reconciler>,
    sweep: Arc<StartupSweep>,
    watch: FsWatchService,
    targets: Vec<WatchTarget>,
    settings: IndexSettings,
    running: Mutex<Option<WatchHandle>>,
}

impl std::fmt::Debug for FileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIndex")
            .field("targets", &self.targets)
            .field("settings", &self.settings)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl FileIndex {
    /// Opens (or creates) the SQLite index at `db_path`.
    pub async fn open(
        db_path: &Path,
        targets: Vec<WatchTarget>,
        settings: IndexSettings,
    ) -> Result<Self> {
        let db_path = resolve_path(db_path)?;
        let store = SqliteIndexStore::open(&db_path).await?;
        Ok(Self::build(Arc::new(store), targets, settings, Some(db_path)))
    }

    /// Builds the index on top of any [`IndexStore`].
    pub fn with_store(
        store: Arc<dyn IndexStore>,
        targets: Vec<WatchTarget>,
        settings: IndexSettings,
    ) -> Self {
        Self::build(store, targets, settings, None)
    }

    fn build(
        store: Arc<dyn IndexStore>,
        targets: Vec<WatchTarget>,
        settings: IndexSettings,
        db_path: Option<PathBuf>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            settings.reconcile.clone(),
        ));
        let mut sweep = StartupSweep::new(
            Arc::clone(&reconciler),
            targets.clone(),
            settings.sweep.clone(),
        );
        if let Some(db_path) = &db_path {
            sweep = sweep.ignore(db_path.clone());
        }
        let sweep = Arc::new(sweep);
        let mut watch = FsWatchService::new(
            settings.watch.clone(),
            targets.clone(),
            Arc::clone(&reconciler),
            Arc::clone(&sweep),
        );
        if let Some(db_path) = db_path {
            watch = watch.ignore(db_path);
        }

        Self {
            store,
            reconciler,
            sweep,
            watch,
            targets,
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Subscribes the watchers, runs the startup sweep (when enabled) and
    /// then lets live events through. Returns the sweep report, or `None`
    /// if the sweep is disabled or watching had already started.
    pub async fn start(&self) -> Result<Option<SweepReport>> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(None);
        }

        let handle = self.watch.start().await;
        let report = if self.settings.sweep.enabled {
            match self.sweep.run().await {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!(error = %err, "startup sweep failed, stopping watchers");
                    handle.stop().await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        handle.release();
        info!(roots = handle.active_roots().len(), "index is live");
        *running = Some(handle);
        Ok(report)
    }

    /// Stops watching. Queued and debouncing events are applied first.
    pub async fn stop(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn is_watching(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Runs a reconciliation sweep now.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep.run().await
    }

    /// Live records matching `filter`, newest first.
    pub async fn list_files(&self, filter: &FileFilter) -> Vec<FileRecord> {
        let records = match filter.category {
            Some(category) => self.store.list_by_category(category).await,
            None => self
                .store
                .list_all()
                .await
                .map(|all| all.into_iter().filter(FileRecord::is_live).collect()),
        };

        degrade(records, "list_files")
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect()
    }

    pub async fn list_tombstoned(&self) -> Vec<FileRecord> {
        degrade(self.store.list_tombstoned().await, "list_tombstoned")
    }

    pub async fn create_folder(&self, name: &str, parent: &Path) -> Result<PathBuf> {
        let parent = resolve_path(parent)?;
        self.reconciler.create_folder(name, &parent).await
    }

    pub async fn upload_file(&self, name: &str, parent: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let parent = resolve_path(parent)?;
        self.reconciler.upload_file(name, &parent, bytes).await
    }

    /// Deletes `path` from disk and moves its record(s) to the trash.
    pub async fn request_delete(&self, path: &Path) -> Result<()> {
        let path = resolve_path(path)?;
        self.reconciler.request_delete(&path).await.map(|_| ())
    }

    /// Purges one tombstoned record, or every eligible one with `None`.
    pub async fn purge_tombstoned(&self, path: Option<&Path>) -> Result<u64> {
        match path {
            Some(path) => {
                let path = resolve_path(path)?;
                self.reconciler.purge_tombstoned(Some(&path)).await
            }
            None => self.reconciler.purge_tombstoned(None).await,
        }
    }

    pub async fn get_stats(&self) -> IndexStats {
        let all = degrade(self.store.list_all().await, "get_stats");
        IndexStats::from_records(&all)
    }

    /// Newest first.
    pub async fn recent_events(&self, limit: u32) -> Vec<FileEvent> {
        degrade(self.store.list_recent_events(limit).await, "recent_events")
    }

    /// Most used live files: by access count, then most recently touched.
    pub async fn suggestions(&self, limit: usize) -> Vec<FileRecord> {
        let mut live = self.list_files(&FileFilter::default()).await;
        live.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
                .then_with(|| a.path.cmp(&b.path))
        });
        live.truncate(limit);
        live
    }

    /// The category folder [`FileIndex::organize_file`] would move `path`
    /// into, or `None` when nothing exists there. Touches neither disk nor
    /// index.
    pub async fn suggest_organization(&self, path: &Path) -> Option<Category> {
        let path = resolve_path(path).ok()?;
        match stat(&path).await {
            Ok(Some(metadata)) if metadata.is_dir() => Some(Category::Folder),
            Ok(Some(_)) => Some(classify_path(&path)),
            Ok(None) => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot stat organize candidate");
                None
            }
        }
    }

    /// Moves a file into `root/<Category>/`. The index records it as a move,
    /// so the file keeps its history.
    pub async fn organize_file(&self, path: &Path, root: &Path) -> Result<PathBuf> {
        let path = resolve_path(path)?;
        let root = resolve_path(root)?;
        self.reconciler.organize_file(&path, &root).await
    }

    /// Files sitting directly in each category folder under `root`. Folders
    /// that do not exist yet are left out.
    pub async fn organization_stats(&self, root: &Path) -> BTreeMap<Category, u64> {
        let mut stats = BTreeMap::new();
        let Ok(root) = resolve_path(root) else {
            return stats;
        };
        for category in Category::ALL {
            let dir = root.join(category.folder_name());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let mut files = 0;
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
                    files += 1;
                }
            }
            stats.insert(category, files);
        }
        stats
    }

    /// Notifications for every committed index change.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexChange> {
        self.reconciler.subscribe()
    }
}

fn degrade<T: Default>(result: Result<T>, operation: &'static str) -> T {
    result.unwrap_or_else(|err| {
        warn!(operation, error = %err, "index read failed, returning empty result");
        T::default()
    })
}

/// Absolute, normalized, and canonical when the path exists.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .map_err(|err| IndexError::InvalidInput(format!("{}: {err}", path.display())))?;
    Ok(std::fs::canonicalize(&absolute).unwrap_or_else(|_| lexical_normalize(&absolute)))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::types::{Category, FileEventKind};

    async fn open_index(settings: IndexSettings) -> (tempfile::TempDir, PathBuf, FileIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("home");
        fs::create_dir(&root).unwrap();
        let root = fs::canonicalize(root).unwrap();
        let index = FileIndex::open(
            &tmp.path().join("index.db"),
            vec![WatchTarget::new(&root)],
            settings,
        )
        .await
        .unwrap();
        (tmp, root, index)
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let (_tmp, root, index) = open_index(IndexSettings::default()).await;
        index.upload_file("a.txt", &root, b"a").await.unwrap();
        index.upload_file("b.png", &root, b"b").await.unwrap();
        index.upload_file("Budget.xlsx", &root, b"c").await.unwrap();

        let all = index.list_files(&FileFilter::default()).await;
        assert_eq!(all.len(), 3);

        let images = index.list_files(&FileFilter::category(Category::Image)).await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "b.png");

        let budget = index.list_files(&FileFilter::text("budget")).await;
        assert_eq!(budget.len(), 1);

        let stats = index.get_stats().await;
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_size_bytes, 3);
        assert_eq!(stats.counts_by_category.get(&Category::Document), Some(&2));
    }

    #[tokio::test]
    async fn trash_lifecycle() {
        let (_tmp, root, index) = open_index(IndexSettings::default()).await;
        let file = index.upload_file("old.pdf", &root, b"x").await.unwrap();

        index.request_delete(&file).await.unwrap();
        assert!(index.list_files(&FileFilter::default()).await.is_empty());
        assert_eq!(index.list_tombstoned().await.len(), 1);
        assert_eq!(index.get_stats().await.total_files, 0);

        assert_eq!(index.purge_tombstoned(None).await.unwrap(), 1);
        assert!(index.list_tombstoned().await.is_empty());

        let kinds: Vec<_> = index
            .recent_events(10)
            .await
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![FileEventKind::Deleted, FileEventKind::Created]);
    }

    #[tokio::test]
    async fn suggestions_rank_by_usage() {
        let (_tmp, root, index) = open_index(IndexSettings::default()).await;
        index.upload_file("rare.txt", &root, b"1").await.unwrap();
        index.upload_file("hot.txt", &root, b"1").await.unwrap();
        // Re-uploading with new content counts as a modification.
        index.upload_file("hot.txt", &root, b"22").await.unwrap();
        index.upload_file("hot.txt", &root, b"333").await.unwrap();

        let top = index.suggestions(1).await;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "hot.txt");
        assert_eq!(top[0].access_count, 3);
    }

    #[tokio::test]
    async fn organizing_moves_into_category_folders() {
        let (tmp, root, index) = open_index(IndexSettings::default()).await;
        fs::create_dir(tmp.path().join("Organized_Files")).unwrap();
        let organized = fs::canonicalize(tmp.path().join("Organized_Files")).unwrap();
        let photo = index.upload_file("beach.JPG", &root, b"jpg").await.unwrap();
        index.upload_file("beach.JPG", &root, b"jpeg").await.unwrap();

        assert_eq!(index.suggest_organization(&photo).await, Some(Category::Image));
        assert_eq!(
            index.suggest_organization(&root).await,
            Some(Category::Folder)
        );
        assert_eq!(index.suggest_organization(&root.join("nope.txt")).await, None);
        assert!(index.organization_stats(&organized).await.is_empty());

        let moved = index.organize_file(&photo, &organized).await.unwrap();
        assert_eq!(moved, organized.join("Images").join("beach.JPG"));
        assert!(!photo.exists());
        assert!(moved.exists());

        let live = index.list_files(&FileFilter::default()).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].path, moved);
        assert_eq!(live[0].access_count, 2, "history follows the file");
        assert_eq!(index.recent_events(1).await[0].kind, FileEventKind::Moved);

        // Already organized: nothing to do.
        assert_eq!(index.organize_file(&moved, &organized).await.unwrap(), moved);

        let stats = index.organization_stats(&organized).await;
        assert_eq!(stats.get(&Category::Image), Some(&1));
        assert_eq!(stats.len(), 1);
    }

    #[tokio::test]
    async fn organizing_never_overwrites() {
        let (tmp, root, index) = open_index(IndexSettings::default()).await;
        let organized = tmp.path().join("Organized_Files");
        fs::create_dir_all(organized.join("Documents")).unwrap();
        fs::write(organized.join("Documents").join("notes.txt"), b"kept").unwrap();
        let notes = index.upload_file("notes.txt", &root, b"new").await.unwrap();

        let err = index.organize_file(&notes, &organized).await.unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists(_)), "{err}");
        assert!(notes.exists());
        assert_eq!(
            fs::read(organized.join("Documents").join("notes.txt")).unwrap(),
            b"kept"
        );
        assert_eq!(index.list_files(&FileFilter::default()).await[0].path, notes);

        let missing = index
            .organize_file(&root.join("gone.txt"), &organized)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
        let dir = index.organize_file(&root, &organized).await.unwrap_err();
        assert!(matches!(dir, IndexError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn start_sweeps_then_stop_is_idempotent() {
        let (_tmp, root, index) = open_index(IndexSettings::default()).await;
        fs::write(root.join("before.txt"), b"x").unwrap();

        let report = index.start().await.unwrap().expect("sweep enabled");
        assert_eq!(report.created, 1);
        assert!(index.is_watching().await);
        assert_eq!(index.start().await.unwrap(), None);

        index.stop().await;
        index.stop().await;
        assert!(!index.is_watching().await);
    }

    #[tokio::test]
    async fn reads_degrade_when_store_is_down() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteIndexStore::open(&tmp.path().join("index.db"))
                .await
                .unwrap(),
        );
        let index = FileIndex::with_store(store.clone(), Vec::new(), IndexSettings::default());
        store.close().await;

        assert!(index.list_files(&FileFilter::default()).await.is_empty());
        assert!(index.list_tombstoned().await.is_empty());
        assert!(index.recent_events(5).await.is_empty());
        assert_eq!(index.get_stats().await, IndexStats::default());

        let err = index
            .create_folder("x", tmp.path())
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
    }
}
