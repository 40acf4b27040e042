//! Configuration file support for the kpfs CLI.
//!
//! Configuration is read from `~/.config/kpfs/config.toml` (XDG standard) or
//! the file named by `--config`. Command-line flags override the file, and
//! `KPFS_CACHE_RETENTION` / `KPFS_UPLOAD_DELAY` override the `[cache]` table.
//!
//! # Example configuration
//!
//! ```toml
//! remote = "/home/user/drive"
//! cache_dir = "/home/user/.cache/kpfs"
//!
//! [cache]
//! retention = "14d"
//! upload_delay = "1s"
//! worker_threads = 2
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kpfs_cache::CacheConfig;
use serde::Deserialize;

/// Contents of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Directory holding the drive contents.
    pub remote: Option<PathBuf>,

    /// Local cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Cache pool tuning.
    pub cache: CacheConfig,
}

impl FileConfig {
    /// Loads `path`, or the default location if `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Effective settings after merging file, flags, and environment.
#[derive(Debug)]
pub struct Settings {
    pub remote: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub cache: CacheConfig,
}

impl Settings {
    pub fn resolve(
        config: Option<&Path>,
        remote: Option<PathBuf>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let file = FileConfig::load(config)?;
        let cache_dir = match cache_dir.or(file.cache_dir) {
            Some(dir) => dir,
            None => default_cache_dir()
                .context("Could not determine a cache directory; pass --cache-dir")?,
        };
        Ok(Self {
            remote: remote.or(file.remote),
            cache_dir,
            cache: file.cache.with_env_overrides(),
        })
    }

    /// The remote directory, required by every drive command.
    pub fn remote(&self) -> Result<&Path> {
        self.remote
            .as_deref()
            .context("No remote configured; pass --remote or set KPFS_REMOTE")
    }
}

/// Default configuration file location.
pub fn config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("kpfs").join("config.toml"))
}

fn default_cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "kpfs", "kpfs").map(|dirs| dirs.cache_dir().to_path_buf())
}
