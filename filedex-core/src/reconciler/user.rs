//! User-initiated mutations. Unlike passive events these never retry: the
//! caller gets the error.

use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use super::{ApplyOptions, ReconcileOutcome, Reconciler, stat};
use crate::classifier::classify_path;
use crate::error::{IndexError, Result};
use crate::normalizer::LogicalEvent;
use crate::types::FileEventKind;

/// Accepts exactly one normal path component.
pub fn validate_entry_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(IndexError::InvalidInput("name must not be empty".into()));
    }

    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !trimmed.contains(['/', '\\']) => Ok(trimmed),
        _ => Err(IndexError::InvalidInput(format!(
            "'{name}' is not a single path component"
        ))),
    }
}

impl Reconciler {
    /// Creates `parent/name` (an existing directory is fine) and indexes it
    /// as a Folder record.
    pub async fn create_folder(&self, name: &str, parent: &Path) -> Result<PathBuf> {
        let name = validate_entry_name(name)?;
        let path = parent.join(name);

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|err| IndexError::from_io(err, &path))?;

        let outcome = self
            .apply(
                &LogicalEvent::new(FileEventKind::Created, path.clone()),
                ApplyOptions::USER,
            )
            .await?;
        info!(path = %path.display(), ?outcome, "folder created");
        Ok(path)
    }

    /// Writes `bytes` to `parent/name`, then indexes the new file. Nothing is
    /// indexed unless the write succeeded.
    pub async fn upload_file(&self, name: &str, parent: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let name = validate_entry_name(name)?;
        let path = parent.join(name);

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| IndexError::from_io(err, &path))?;

        let outcome = self
            .apply(
                &LogicalEvent::new(FileEventKind::Created, path.clone()),
                ApplyOptions::USER,
            )
            .await?;
        info!(path = %path.display(), size = bytes.len(), ?outcome, "file uploaded");
        Ok(path)
    }

    /// Removes `path` from disk (recursively for directories) and tombstones
    /// it together with everything indexed below it.
    ///
    /// The path and every record indexed below it are locked for the whole
    /// removal, so watcher events for those descendants wait until the
    /// tombstones are committed. Entries created under the directory after
    /// the listing are not locked; their events re-stat and find them gone.
    pub async fn request_delete(&self, path: &Path) -> Result<ReconcileOutcome> {
        let mut locked: Vec<PathBuf> = self
            .store
            .list_live_under(path)
            .await?
            .into_iter()
            .map(|record| record.path)
            .collect();
        locked.push(path.to_path_buf());
        let _guards = self.locks.lock_many(locked).await;

        let existing = self.store.get(path).await?;
        if existing.as_ref().is_some_and(|record| record.is_tombstoned()) {
            return Ok(ReconcileOutcome::Unchanged);
        }
        if existing.is_none() && self.store.list_live_under(path).await?.is_empty() {
            return Err(IndexError::PathNotFound(path.to_path_buf()));
        }

        if let Some(metadata) = stat(path).await? {
            let removal = if metadata.is_dir() {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_file(path).await
            };
            match removal {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "delete refused by filesystem");
                    return Err(IndexError::from_io(err, path));
                }
            }
        }

        let outcome = self.tombstone_tree(path, existing, Utc::now()).await?;
        info!(path = %path.display(), ?outcome, "moved to trash");
        Ok(outcome)
    }

    /// Moves a file into `root/<Category>/` and carries its record along as a
    /// move. A file already under `root` stays where it is, and an existing
    /// entry at the destination is never replaced.
    pub async fn organize_file(&self, path: &Path, root: &Path) -> Result<PathBuf> {
        if path.starts_with(root) {
            return Ok(path.to_path_buf());
        }
        let name = path.file_name().ok_or_else(|| {
            IndexError::InvalidInput(format!("{} has no file name", path.display()))
        })?;
        let dest_dir = root.join(classify_path(path).folder_name());
        let dest = dest_dir.join(name);

        let _guards = self.locks.lock_pair(path, &dest).await;
        let Some(metadata) = stat(path).await? else {
            return Err(IndexError::PathNotFound(path.to_path_buf()));
        };
        if metadata.is_dir() {
            return Err(IndexError::InvalidInput(format!(
                "{} is a directory, only files are organized",
                path.display()
            )));
        }
        if stat(&dest).await?.is_some() {
            warn!(path = %path.display(), dest = %dest.display(), "organize target taken");
            return Err(IndexError::AlreadyExists(dest));
        }

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|err| IndexError::from_io(err, &dest_dir))?;
        tokio::fs::rename(path, &dest)
            .await
            .map_err(|err| IndexError::from_io(err, path))?;

        let outcome = self.apply_move(path, &dest, ApplyOptions::USER).await?;
        info!(from = %path.display(), to = %dest.display(), ?outcome, "file organized");
        Ok(dest)
    }

    /// Physically drops tombstoned records whose path is absent on disk.
    /// `None` considers every tombstoned record. Returns how many were purged.
    pub async fn purge_tombstoned(&self, path: Option<&Path>) -> Result<u64> {
        let candidates: Vec<PathBuf> = match path {
            Some(path) => self
                .store
                .get(path)
                .await?
                .filter(|record| record.is_tombstoned())
                .map(|record| vec![record.path])
                .unwrap_or_default(),
            None => self
                .store
                .list_tombstoned()
                .await?
                .into_iter()
                .map(|record| record.path)
                .collect(),
        };

        let mut purged = 0;
        for candidate in candidates {
            let _guard = self.locks.lock(&candidate).await;
            if stat(&candidate).await?.is_some() {
                info!(path = %candidate.display(), "skipping purge, path exists on disk");
                continue;
            }
            if self.store.purge_tombstoned(&candidate).await? {
                purged += 1;
            }
        }

        if purged > 0 {
            info!(purged, "purged tombstoned records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_must_be_single_components() {
        assert_eq!(validate_entry_name("Projects").unwrap(), "Projects");
        assert_eq!(validate_entry_name("  notes.txt ").unwrap(), "notes.txt");

        for bad in ["", "   ", ".", "..", "a/b", "/abs", "a\\b"] {
            let err = validate_entry_name(bad).unwrap_err();
            assert!(matches!(err, IndexError::InvalidInput(_)), "{bad:?} accepted");
        }
    }
}
