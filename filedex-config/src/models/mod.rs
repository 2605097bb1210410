use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use directories::{ProjectDirs, UserDirs};
use filedex_core::{IndexSettings, WatchTarget};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{expand_home, parse_bool, parse_csv};

pub const CONFIG_PATH_VAR: &str = "FILEDEX_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "FILEDEX_CONFIG_JSON";
pub const DATABASE_PATH_VAR: &str = "FILEDEX_DATABASE_PATH";
pub const WATCH_TARGETS_VAR: &str = "FILEDEX_WATCH_TARGETS";
pub const SWEEP_ON_START_VAR: &str = "FILEDEX_SWEEP_ON_START";

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
    /// Decide from the content.
    Sniff,
}

impl ConfigFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            Some("toml" | "tml") => Self::Toml,
            _ => Self::Sniff,
        }
    }
}

/// Everything the `filedex` binary needs to open and run an index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FiledexConfig {
    /// SQLite file holding the index. Created on first use.
    pub database_path: PathBuf,
    /// Directories watched recursively. Missing ones are skipped with a
    /// warning at startup.
    pub watch_targets: Vec<PathBuf>,
    /// Where `mkdir` creates folders when no parent is given. Falls back to
    /// the first watch target.
    pub default_folder_parent: Option<PathBuf>,
    /// Where `upload` writes files when no destination is given. Falls back
    /// to the first watch target.
    pub default_upload_parent: Option<PathBuf>,
    /// Root of the per-category folders `organize` moves files into.
    /// Defaults to `~/Organized_Files`.
    pub organized_root: Option<PathBuf>,
    /// Debounce, sweep and write-retry tuning (`[watch]`, `[sweep]` and
    /// `[reconcile]` tables).
    #[serde(flatten)]
    pub index: IndexSettings,
}

impl Default for FiledexConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            watch_targets: default_watch_targets(),
            default_folder_parent: None,
            default_upload_parent: None,
            organized_root: None,
            index: IndexSettings::default(),
        }
    }
}

impl FiledexConfig {
    /// Load configuration using environment variables.
    /// Evaluation order:
    /// 1) `$FILEDEX_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$FILEDEX_CONFIG_JSON` (inline JSON),
    /// 3) `filedex.toml`, `filedex.json` or `config/filedex.toml` in the
    ///    working directory,
    /// 4) defaults if none is present.
    ///
    /// Single-value overrides (`$FILEDEX_DATABASE_PATH`,
    /// `$FILEDEX_WATCH_TARGETS`, `$FILEDEX_SWEEP_ON_START`) apply on top.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let (mut config, source) = Self::load_base()?;
        config.apply_overrides(|name| env::var(name).ok());
        Ok((config, source))
    }

    fn load_base() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = expand_home(Path::new(path_str.trim()));
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_VAR)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    /// Reads a config file. Relative paths inside it are taken relative to
    /// the file's directory, not the working directory.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let path = expand_home(path);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read filedex config from {}", path.display()))?;

        let origin = path.display().to_string();
        let mut config = Self::parse(&contents, ConfigFormat::of(&path), &origin)?;
        if let Some(base) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            config.anchor_relative_paths(base);
        }
        Ok(config)
    }

    /// Parses TOML or JSON, chosen by the first non-blank character.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        Self::parse(contents, ConfigFormat::Sniff, origin)
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        Self::parse(raw, ConfigFormat::Json, CONFIG_JSON_VAR)
    }

    fn parse(contents: &str, format: ConfigFormat, origin: &str) -> anyhow::Result<Self> {
        let format = match format {
            ConfigFormat::Sniff if contents.trim_start().starts_with('{') => ConfigFormat::Json,
            ConfigFormat::Sniff => ConfigFormat::Toml,
            known => known,
        };
        match format {
            ConfigFormat::Json => serde_json::from_str(contents)
                .map_err(|err| anyhow!("invalid filedex config {origin} (json): {err}")),
            _ => toml::from_str(contents)
                .map_err(|err| anyhow!("invalid filedex config {origin} (toml): {err}")),
        }
    }

    fn anchor_relative_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() && !path.starts_with("~") {
                *path = base.join(&*path);
            }
        };
        anchor(&mut self.database_path);
        self.watch_targets.iter_mut().for_each(anchor);
        self.default_folder_parent.iter_mut().for_each(anchor);
        self.default_upload_parent.iter_mut().for_each(anchor);
        self.organized_root.iter_mut().for_each(anchor);
    }

    /// Applies single-value overrides looked up by variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DATABASE_PATH_VAR)
            && !path.trim().is_empty()
        {
            self.database_path = PathBuf::from(path.trim());
        }

        if let Some(raw) = lookup(WATCH_TARGETS_VAR) {
            let targets = parse_csv(&raw);
            if !targets.is_empty() {
                self.watch_targets = targets.into_iter().map(PathBuf::from).collect();
            }
        }

        if let Some(raw) = lookup(SWEEP_ON_START_VAR) {
            match parse_bool(&raw) {
                Some(enabled) => self.index.sweep.enabled = enabled,
                None => warn!(value = %raw, "ignoring unparseable {SWEEP_ON_START_VAR}"),
            }
        }
    }

    /// The database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database_path)
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.watch_targets
            .iter()
            .map(|path| WatchTarget::new(expand_home(path)))
            .collect()
    }

    pub fn folder_parent(&self) -> anyhow::Result<PathBuf> {
        self.parent_or_first_target(self.default_folder_parent.as_deref())
    }

    pub fn upload_parent(&self) -> anyhow::Result<PathBuf> {
        self.parent_or_first_target(self.default_upload_parent.as_deref())
    }

    /// `organized_root` with `~` expanded, or `~/Organized_Files`.
    pub fn organized_root(&self) -> PathBuf {
        let root = self
            .organized_root
            .as_deref()
            .unwrap_or(Path::new("~/Organized_Files"));
        expand_home(root)
    }

    fn parent_or_first_target(&self, configured: Option<&Path>) -> anyhow::Result<PathBuf> {
        configured
            .or_else(|| self.watch_targets.first().map(PathBuf::as_path))
            .map(expand_home)
            .context("no destination given and no watch targets are configured")
    }

    fn find_default_file() -> Option<PathBuf> {
        default_file_candidates()
            .into_iter()
            .find(|path| path.is_file())
    }
}

/// Where an unconfigured run looks for a config file: the working directory
/// first, then the platform config directory, then `~/.filedex.toml`.
pub fn default_file_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = ["filedex.toml", "filedex.json", "config/filedex.toml"]
        .into_iter()
        .map(PathBuf::from)
        .collect();
    if let Some(dirs) = ProjectDirs::from("", "", "filedex") {
        candidates.push(dirs.config_dir().join("filedex.toml"));
    }
    let dotfile = expand_home(Path::new("~/.filedex.toml"));
    if dotfile.is_absolute() {
        candidates.push(dotfile);
    }
    candidates
}

/// `filedex.db` in the platform data directory.
pub fn default_database_path() -> PathBuf {
    ProjectDirs::from("", "", "filedex")
        .map(|dirs| dirs.data_dir().join("filedex.db"))
        .unwrap_or_else(|| PathBuf::from("filedex.db"))
}

/// The user's Desktop, Documents, Downloads, Pictures and Videos folders,
/// whichever the platform reports.
pub fn default_watch_targets() -> Vec<PathBuf> {
    let Some(dirs) = UserDirs::new() else {
        return Vec::new();
    };
    [
        dirs.desktop_dir(),
        dirs.document_dir(),
        dirs.download_dir(),
        dirs.picture_dir(),
        dirs.video_dir(),
    ]
    .into_iter()
    .flatten()
    .map(Path::to_path_buf)
    .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use filedex_core::ReconcileConfig;

    use super::*;

    #[test]
    fn toml_sections_override_defaults() {
        let config = FiledexConfig::parse_from_str(
            r#"
            database_path = "/var/lib/filedex/index.db"
            watch_targets = ["/srv/share", "/home/me/Documents"]
            default_upload_parent = "/srv/share/incoming"

            [watch]
            debounce_window_ms = 250
            workers = 8

            [sweep]
            enabled = false
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/filedex/index.db"));
        assert_eq!(config.watch_targets.len(), 2);
        assert_eq!(config.index.watch.debounce_window(), Duration::from_millis(250));
        assert_eq!(config.index.watch.workers, 8);
        // Untouched keys keep their defaults.
        assert_eq!(config.index.watch.channel_capacity, 4096);
        assert!(!config.index.sweep.enabled);
        assert_eq!(config.index.reconcile, ReconcileConfig::default());
        assert_eq!(
            config.upload_parent().unwrap(),
            PathBuf::from("/srv/share/incoming")
        );
        assert_eq!(config.folder_parent().unwrap(), PathBuf::from("/srv/share"));
    }

    #[test]
    fn json_is_accepted_as_a_fallback() {
        let config = FiledexConfig::parse_from_str(
            r#"{"watch_targets": ["/data"], "reconcile": {"index_directories": true}}"#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.watch_targets, vec![PathBuf::from("/data")]);
        assert!(config.index.reconcile.index_directories);
        assert_eq!(config.database_path, default_database_path());
    }

    #[test]
    fn parse_errors_name_the_origin() {
        let err = FiledexConfig::parse_from_str("watch_targets = 7", "broken.conf").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken.conf"), "{message}");
        assert!(message.contains("(toml)"), "{message}");

        let err = FiledexConfig::parse_from_str(r#"{"watch_targets": 7}"#, "inline").unwrap_err();
        assert!(err.to_string().contains("(json)"), "{err}");
    }

    #[test]
    fn files_are_parsed_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("filedex.toml");
        fs::write(&toml_path, "watch_targets = [\"/a\"]\n").unwrap();
        let from_toml = FiledexConfig::load_from_file(&toml_path).unwrap();
        assert_eq!(from_toml.watch_targets, vec![PathBuf::from("/a")]);

        let json_path = dir.path().join("filedex.json");
        fs::write(&json_path, r#"{"watch_targets": ["/b"]}"#).unwrap();
        let from_json = FiledexConfig::load_from_file(&json_path).unwrap();
        assert_eq!(from_json.watch_targets, vec![PathBuf::from("/b")]);

        // Extension decides the parser: JSON in a .toml file is an error.
        fs::write(&toml_path, r#"{"watch_targets": ["/c"]}"#).unwrap();
        assert!(FiledexConfig::load_from_file(&toml_path).is_err());

        let missing = FiledexConfig::load_from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(missing.to_string().contains("failed to read"));
    }

    #[test]
    fn relative_paths_in_files_follow_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filedex.conf");
        fs::write(
            &path,
            r#"
            database_path = "state/index.db"
            watch_targets = ["inbox", "/abs", "~/Documents"]
            organized_root = "sorted"
            "#,
        )
        .unwrap();

        let config = FiledexConfig::load_from_file(&path).unwrap();
        assert_eq!(config.database_path, dir.path().join("state/index.db"));
        assert_eq!(
            config.watch_targets,
            vec![
                dir.path().join("inbox"),
                PathBuf::from("/abs"),
                PathBuf::from("~/Documents")
            ]
        );
        assert_eq!(config.organized_root(), dir.path().join("sorted"));
    }

    #[test]
    fn organized_root_defaults_under_home() {
        let root = FiledexConfig::default().organized_root();
        assert!(root.ends_with("Organized_Files"));
    }

    #[test]
    fn default_candidates_start_in_the_working_directory() {
        let candidates = default_file_candidates();
        assert_eq!(candidates[0], PathBuf::from("filedex.toml"));
        assert!(
            candidates
                .iter()
                .skip(3)
                .all(|candidate| candidate.is_absolute())
        );
    }

    #[test]
    fn overrides_apply_on_top_of_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (DATABASE_PATH_VAR, " /tmp/override.db "),
            (WATCH_TARGETS_VAR, "/one, /two"),
            (SWEEP_ON_START_VAR, "no"),
        ]);
        let mut config = FiledexConfig {
            watch_targets: vec![PathBuf::from("/original")],
            ..FiledexConfig::default()
        };

        config.apply_overrides(|name| vars.get(name).map(|value| value.to_string()));

        assert_eq!(config.database_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(
            config.watch_targets,
            vec![PathBuf::from("/one"), PathBuf::from("/two")]
        );
        assert!(!config.index.sweep.enabled);
    }

    #[test]
    fn blank_or_invalid_overrides_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (DATABASE_PATH_VAR, "  "),
            (WATCH_TARGETS_VAR, " , "),
            (SWEEP_ON_START_VAR, "sometimes"),
        ]);
        let mut config = FiledexConfig::default();
        let before = config.clone();

        config.apply_overrides(|name| vars.get(name).map(|value| value.to_string()));
        assert_eq!(config, before);
    }

    #[test]
    fn destinations_need_a_target_or_explicit_parent() {
        let config = FiledexConfig {
            watch_targets: Vec::new(),
            ..FiledexConfig::default()
        };
        assert!(config.folder_parent().is_err());
        assert!(config.upload_parent().is_err());
    }

    #[test]
    fn default_database_lives_in_a_data_directory() {
        let path = default_database_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("filedex.db"));
    }
}
