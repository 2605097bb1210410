use anyhow::{Context, Result, anyhow};
use filedex_config::FiledexConfig;
use filedex_core::{FileFilter, FileIndex};
use tracing::info;

use super::Command;
use crate::output;

pub(super) async fn dispatch(index: &FileIndex, config: &FiledexConfig, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(index).await,
        Command::Sweep { json } => {
            let report = index.sweep().await.context("sweep failed")?;
            output::sweep_report(&report, json)
        }
        Command::List {
            category,
            query,
            json,
        } => {
            let filter = FileFilter {
                category,
                text_query: query,
            };
            output::records(&index.list_files(&filter).await, json)
        }
        Command::Trash { json } => output::records(&index.list_tombstoned().await, json),
        Command::Purge { path } => {
            let purged = index
                .purge_tombstoned(path.as_deref())
                .await
                .context("purge failed")?;
            println!("purged {purged}");
            Ok(())
        }
        Command::Stats { json } => output::stats(&index.get_stats().await, json),
        Command::Events { limit, json } => output::events(&index.recent_events(limit).await, json),
        Command::Suggest { limit, json } => output::records(&index.suggestions(limit).await, json),
        Command::Mkdir { name, parent } => {
            let parent = match parent {
                Some(parent) => parent,
                None => config.folder_parent()?,
            };
            let path = index
                .create_folder(&name, &parent)
                .await
                .with_context(|| format!("could not create folder '{name}'"))?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Upload { source, name, dest } => {
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("{} has no file name", source.display()))?,
            };
            let dest = match dest {
                Some(dest) => dest,
                None => config.upload_parent()?,
            };
            let bytes = tokio::fs::read(&source)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
            let path = index
                .upload_file(&name, &dest, &bytes)
                .await
                .with_context(|| format!("could not upload '{name}'"))?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Delete { path } => {
            index
                .request_delete(&path)
                .await
                .with_context(|| format!("could not delete {}", path.display()))?;
            println!("deleted {}", path.display());
            Ok(())
        }
        Command::Organize {
            path,
            suggest: true,
            ..
        } => {
            let category = index
                .suggest_organization(&path)
                .await
                .ok_or_else(|| anyhow!("{} does not exist", path.display()))?;
            println!("{}", category.folder_name());
            Ok(())
        }
        Command::Organize { path, root, .. } => {
            let root = root.unwrap_or_else(|| config.organized_root());
            let dest = index
                .organize_file(&path, &root)
                .await
                .with_context(|| format!("could not organize {}", path.display()))?;
            println!("{}", dest.display());
            Ok(())
        }
        Command::Organized { root, json } => {
            let root = root.unwrap_or_else(|| config.organized_root());
            output::organization(&index.organization_stats(&root).await, json)
        }
    }
}

async fn watch(index: &FileIndex) -> Result<()> {
    if let Some(report) = index.start().await.context("failed to start watching")? {
        output::sweep_report(&report, false)?;
    }
    for target in index.targets() {
        info!(root = %target, "watching");
    }

    let mut changes = index.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => output::change(&change),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "change feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("stopping, applying queued events");
    index.stop().await;
    Ok(())
}
