mod support;

use std::fs;

use filedex_core::{Category, FileEventKind, FileFilter, IndexError, IndexSettings};
use support::{open_fixture, test_settings, write};

#[tokio::test]
async fn restart_sweep_catches_offline_changes() {
    let fx = open_fixture(test_settings()).await;
    let keep = fx.root.join("keep.txt");
    let gone = fx.root.join("gone.txt");
    let edited = fx.root.join("edited.csv");
    write(&keep, b"keep");
    write(&gone, b"gone");
    write(&edited, b"a,b");

    let first = fx.index.start().await.unwrap().unwrap();
    assert_eq!(first.created, 3);
    fx.index.stop().await;

    // Changes while nothing is running.
    fs::remove_file(&gone).unwrap();
    write(&edited, b"a,b\nc,d");
    let added = fx.root.join("nested").join("added.flac");
    write(&added, b"flac");

    let fx = fx.reopen(test_settings()).await;
    let report = fx.index.start().await.unwrap().unwrap();
    assert_eq!(report.tombstoned, 1);
    assert_eq!(report.modified, 1);
    assert_eq!(report.created, 1);

    let mut expected = vec![keep.clone(), edited.clone(), added.clone()];
    expected.sort();
    assert_eq!(fx.live_paths().await, expected);

    let tombstoned = fx.index.list_tombstoned().await;
    assert_eq!(tombstoned.len(), 1);
    assert_eq!(tombstoned[0].path, gone);

    fx.index.stop().await;
}

#[tokio::test]
async fn disabled_sweep_leaves_index_untouched() {
    let fx = open_fixture(IndexSettings {
        sweep: filedex_core::SweepConfig {
            enabled: false,
            ..Default::default()
        },
        ..test_settings()
    })
    .await;
    write(&fx.root.join("unseen.txt"), b"x");

    assert_eq!(fx.index.start().await.unwrap(), None);
    assert!(fx.live_paths().await.is_empty());
    fx.index.stop().await;
}

#[tokio::test]
async fn folder_upload_delete_purge_round() {
    let fx = open_fixture(test_settings()).await;

    let folder = fx.index.create_folder("Receipts", &fx.root).await.unwrap();
    let receipt = fx
        .index
        .upload_file("march.pdf", &folder, b"%PDF")
        .await
        .unwrap();

    let folders = fx.index.list_files(&FileFilter::category(Category::Folder)).await;
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].path, folder);
    assert_eq!(fx.index.get_stats().await.total_files, 2);

    fx.index.request_delete(&folder).await.unwrap();
    assert!(!folder.exists());
    assert_eq!(fx.index.list_tombstoned().await.len(), 2);
    assert!(fx.live_paths().await.is_empty());

    assert_eq!(fx.index.purge_tombstoned(Some(&receipt)).await.unwrap(), 1);
    assert_eq!(fx.index.purge_tombstoned(None).await.unwrap(), 1);
    assert_eq!(fx.index.purge_tombstoned(None).await.unwrap(), 0);
    assert!(fx.index.list_tombstoned().await.is_empty());
}

#[tokio::test]
async fn user_errors_are_typed() {
    let fx = open_fixture(test_settings()).await;

    let err = fx
        .index
        .request_delete(&fx.root.join("nope.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::PathNotFound(_)));

    let err = fx
        .index
        .create_folder("../outside", &fx.root)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidInput(_)));

    assert!(fx.index.recent_events(10).await.is_empty());
}

#[tokio::test]
async fn deleted_then_recreated_file_is_resurrected_after_restart() {
    let fx = open_fixture(test_settings()).await;
    let file = fx.root.join("phoenix.txt");
    write(&file, b"v1");
    fx.index.start().await.unwrap();
    fx.index.stop().await;

    fs::remove_file(&file).unwrap();
    let fx = fx.reopen(test_settings()).await;
    fx.index.sweep().await.unwrap();
    assert_eq!(fx.index.list_tombstoned().await.len(), 1);

    write(&file, b"v2");
    fx.index.sweep().await.unwrap();

    let live = fx.index.list_files(&FileFilter::default()).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].access_count, 2);
    assert!(fx.index.list_tombstoned().await.is_empty());

    let kinds: Vec<_> = fx
        .index
        .recent_events(10)
        .await
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            FileEventKind::Created,
            FileEventKind::Deleted,
            FileEventKind::Created
        ]
    );
}
