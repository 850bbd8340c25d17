use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::fingerprint::FingerprintParams;
use crate::index::DEFAULT_SHARD_CEILING;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Directory of `<track_id>.json` chroma files (used when `index` has no CLI arg).
    pub chroma_dir: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub fingerprint: FingerprintParams,
    pub index: IndexConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Rows after which a new hash shard is opened.
    pub shard_row_ceiling: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shard_row_ceiling: DEFAULT_SHARD_CEILING,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Relative weight tolerance when matching codes.
    pub weight_margin: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { weight_margin: 0.60 }
    }
}

impl AppConfig {
    /// Load config from `~/.config/coverprint/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("coverprint.db")
    } else {
        // Fallback: current directory
        PathBuf::from("coverprint.db")
    }
}
