use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filedex_config::{ConfigSource, FiledexConfig};
use filedex_core::{Category, FileIndex};
use tracing::debug;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "filedex",
    version,
    about = "Watch directories and keep a searchable index of their files"
)]
pub struct Cli {
    /// Configuration file (TOML or JSON). Overrides $FILEDEX_CONFIG_PATH.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Index database location.
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sweep, then watch the configured directories until Ctrl-C
    Watch,
    /// Reconcile the index against the filesystem once
    Sweep {
        #[arg(long)]
        json: bool,
    },
    /// List live files, newest first
    List {
        /// document, image, video, audio, archive, folder or other
        #[arg(long)]
        category: Option<Category>,
        /// Case-insensitive match on name and path
        #[arg(long, short)]
        query: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List deleted files still remembered by the index
    Trash {
        #[arg(long)]
        json: bool,
    },
    /// Forget tombstoned records (all of them without PATH)
    Purge { path: Option<PathBuf> },
    /// Totals by category
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Recent index events, newest first
    Events {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Most used files
    Suggest {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Create a folder and index it
    Mkdir {
        name: String,
        /// Defaults to `default_folder_parent`, then the first watch target
        #[arg(long)]
        parent: Option<PathBuf>,
    },
    /// Copy a file into a watched directory and index it
    Upload {
        source: PathBuf,
        /// Name at the destination; defaults to the source file name
        #[arg(long)]
        name: Option<String>,
        /// Defaults to `default_upload_parent`, then the first watch target
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Delete a file or folder from disk and move its record to the trash
    Delete { path: PathBuf },
    /// Move a file into its category folder under the organized root
    Organize {
        path: PathBuf,
        /// Only print the category the file would go to
        #[arg(long)]
        suggest: bool,
        /// Defaults to `organized_root`
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Files per category folder under the organized root
    Organized {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let database = config.database_path();
    let index = FileIndex::open(&database, config.targets(), config.index.clone())
        .await
        .with_context(|| format!("failed to open index at {}", database.display()))?;
    debug!(database = %database.display(), "index opened");

    commands::dispatch(&index, &config, cli.command).await
}

fn load_config(cli: &Cli) -> Result<FiledexConfig> {
    let (mut config, source) = match &cli.config {
        Some(path) => {
            let mut config = FiledexConfig::load_from_file(path)?;
            config.apply_overrides(|name| std::env::var(name).ok());
            (config, ConfigSource::File(path.clone()))
        }
        None => FiledexConfig::load_from_env()?,
    };
    debug!(?source, "configuration loaded");

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}
