//! Loader configuration.
//!
//! Values come from an optional `kote.toml` and are overridden by
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::LoaderError;

const DEFAULT_QUEUE_POLL_MS: u64 = 1000;

/// Contents of `kote.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub owner_id: Option<i64>,
    pub prefix: Option<String>,
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub integrity_files: Vec<PathBuf>,
}

impl FileConfig {
    pub fn parse(toml_str: &str) -> Result<Self, LoaderError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Read the file if it exists; a missing file is an empty config.
    pub fn read(path: &Path) -> Result<Self, LoaderError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Plugin root (default: `modules`).
    pub plugin_dir: PathBuf,
    /// Mailbox file polled by the queue worker (default: `command.json`).
    pub mailbox: PathBuf,
    /// Loaded-state file rewritten after every queue request (default: `state.json`).
    pub state_file: PathBuf,
    /// Path of `kote.toml`; also a default integrity-checked file.
    pub config_file: PathBuf,
    pub owner_id: Option<i64>,
    /// Prefix used until one is stored in the settings table.
    pub default_prefix: String,
    pub queue_poll: Duration,
    /// How long an ambiguous alias waits for the operator's choice.
    pub alias_ttl: Duration,
    /// Tell callers below a command's level that they were refused.
    pub denial_notice: bool,
    pub integrity_root: PathBuf,
    pub integrity_files: Vec<PathBuf>,
}

impl LoaderConfig {
    /// Build config from `KOTE_CONFIG` (default `kote.toml`) and the
    /// environment.
    pub fn from_env() -> Result<Self, LoaderError> {
        let config_file =
            PathBuf::from(std::env::var("KOTE_CONFIG").unwrap_or_else(|_| "kote.toml".into()));
        let file = FileConfig::read(&config_file)?;
        Ok(Self::from_file(config_file, file))
    }

    fn from_file(config_file: PathBuf, file: FileConfig) -> Self {
        Self::from_sources(config_file, file, |key| std::env::var(key).ok())
    }

    fn from_sources(
        config_file: PathBuf,
        file: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut integrity_files: Vec<PathBuf> = std::env::current_exe().into_iter().collect();
        integrity_files.push(config_file.clone());
        integrity_files.extend(file.integrity_files);
        if let Some(extra) = env("KOTE_INTEGRITY_FILES") {
            integrity_files.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            );
        }

        Self {
            plugin_dir: env("KOTE_PLUGIN_DIR")
                .map(PathBuf::from)
                .or(file.plugin_dir)
                .unwrap_or_else(|| PathBuf::from("modules")),
            mailbox: PathBuf::from(env("KOTE_MAILBOX").unwrap_or_else(|| "command.json".into())),
            state_file: PathBuf::from(
                env("KOTE_STATE_FILE").unwrap_or_else(|| "state.json".into()),
            ),
            owner_id: env("KOTE_OWNER_ID")
                .and_then(|v| v.parse().ok())
                .or(file.owner_id),
            default_prefix: env("KOTE_PREFIX")
                .or(file.prefix)
                .unwrap_or_else(|| ".".into()),
            queue_poll: Duration::from_millis(
                env("KOTE_QUEUE_POLL_MS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_QUEUE_POLL_MS),
            ),
            alias_ttl: Duration::from_secs(
                env("KOTE_ALIAS_TTL_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            denial_notice: env("KOTE_DENIAL_NOTICE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            integrity_root: PathBuf::from("."),
            integrity_files,
            config_file,
        }
    }

    /// Self-contained layout under `root`, no integrity files. Used by
    /// tests and headless runs.
    pub fn for_root(root: &Path) -> Self {
        Self {
            plugin_dir: root.join("modules"),
            mailbox: root.join("command.json"),
            state_file: root.join("state.json"),
            config_file: root.join("kote.toml"),
            owner_id: None,
            default_prefix: ".".into(),
            queue_poll: Duration::from_millis(DEFAULT_QUEUE_POLL_MS),
            alias_ttl: Duration::from_secs(120),
            denial_notice: false,
            integrity_root: root.to_path_buf(),
            integrity_files: Vec::new(),
        }
    }
}
