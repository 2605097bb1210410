//! # filedex-core
//!
//! File-event ingestion and indexing core: watches a set of directories,
//! turns bursty, duplicated and reordered filesystem notifications into one
//! logical event per change, and keeps a persistent SQLite index of files and
//! an append-only event log consistent with what is on disk.
//!
//! ## Architecture
//!
//! Data flows leaf-first through:
//!
//! - [`fs_watch`]: `notify` watchers feeding a bounded channel
//! - [`normalizer`]: per-path debouncing, dedup and move pairing
//! - [`reconciler`]: the single writer, re-stats every path it touches
//! - [`database`]: the [`IndexStore`] port and its SQLite implementation
//! - [`sweep`]: startup / resync reconciliation against the filesystem
//!
//! [`FileIndex`] ties them together and is the only type most callers need.
//!
//! ## Example
//!
//! ```no_run
//! use filedex_core::{FileFilter, FileIndex, IndexSettings, WatchTarget};
//!
//! async fn run() -> filedex_core::Result<()> {
//!     let index = FileIndex::open(
//!         "filedex.db".as_ref(),
//!         vec![WatchTarget::new("/home/me/Documents")],
//!         IndexSettings::default(),
//!     )
//!     .await?;
//!
//!     index.start().await?;
//!     for record in index.list_files(&FileFilter::text("invoice")).await {
//!         println!("{} ({} bytes)", record.path.display(), record.size_bytes);
//!     }
//!     index.stop().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Extension to category mapping
pub mod classifier;
/// Core runtime settings
pub mod config;
/// Index store port and SQLite implementation
pub mod database;
/// Error types
pub mod error;
/// Filesystem watcher adapter
pub mod fs_watch;
/// Debouncing and move pairing
pub mod normalizer;
/// Index state machine and user mutations
pub mod reconciler;
/// The `FileIndex` facade
pub mod service;
/// Startup and resync sweeps
pub mod sweep;
/// Domain types
pub mod types;

pub use classifier::{classify, classify_path};
pub use config::{IndexSettings, ReconcileConfig, SweepConfig, WatchConfig};
pub use database::{IndexStore, SqliteIndexStore, StoreOp};
pub use error::{IndexError, Result};
pub use fs_watch::{FsWatchService, WatchHandle};
pub use normalizer::{Debouncer, LogicalEvent, RawEvent};
pub use reconciler::{ApplyOptions, ReconcileOutcome, Reconciler};
pub use service::FileIndex;
pub use sweep::{StartupSweep, SweepReport};
pub use types::*;

/// Embedded schema migrations for the index database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
