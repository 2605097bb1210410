//! Shared fixtures for core integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filedex_core::{FileIndex, IndexSettings, WatchConfig, WatchTarget};
use tempfile::TempDir;

/// How long a live-watcher assertion may wait for the pipeline.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IndexFixture {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub index: FileIndex,
}

/// Fast debounce so tests do not wait on the production default.
pub fn test_settings() -> IndexSettings {
    IndexSettings {
        watch: WatchConfig {
            debounce_window_ms: 100,
            workers: 2,
            ..WatchConfig::default()
        },
        ..IndexSettings::default()
    }
}

pub async fn open_fixture(settings: IndexSettings) -> IndexFixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("watched");
    fs::create_dir(&root).expect("create root");
    let root = fs::canonicalize(root).expect("canonical root");
    let db_path = tmp.path().join("state").join("filedex.db");

    let index = FileIndex::open(&db_path, vec![WatchTarget::new(&root)], settings)
        .await
        .expect("open index");

    IndexFixture {
        tmp,
        root,
        db_path,
        index,
    }
}

impl IndexFixture {
    /// Reopens the same database, as a restarted process would.
    pub async fn reopen(self, settings: IndexSettings) -> IndexFixture {
        let IndexFixture {
            tmp,
            root,
            db_path,
            index,
        } = self;
        index.stop().await;
        drop(index);

        let index = FileIndex::open(&db_path, vec![WatchTarget::new(&root)], settings)
            .await
            .expect("reopen index");
        IndexFixture {
            tmp,
            root,
            db_path,
            index,
        }
    }

    pub async fn live_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .index
            .list_files(&Default::default())
            .await
            .into_iter()
            .map(|record| record.path)
            .collect();
        paths.sort();
        paths
    }
}

/// Polls `check` until it returns true or the settle timeout passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn write(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, contents).expect("write file");
}
