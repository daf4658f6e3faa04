//! Per-user directories for configuration and log files.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The OS did not provide a configuration directory.
    #[error("could not determine OS configuration directory")]
    NoConfigDir,
    #[error("platform I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Resolved locations (XDG on Linux, Known Folders on Windows, Library on
/// macOS).
#[derive(Debug, Clone)]
pub struct PlatformDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// Holds the JSON log file when file logging is on.
    pub log_dir: PathBuf,
}

const APP_NAME: &str = "gamelink";

impl PlatformDirs {
    /// Resolve directories without creating them.
    pub fn resolve() -> Result<Self, PlatformError> {
        let config_dir = dirs::config_dir()
            .ok_or(PlatformError::NoConfigDir)?
            .join(APP_NAME);
        let log_dir = dirs::cache_dir()
            .map(|base| base.join(APP_NAME))
            .unwrap_or_else(|| config_dir.clone())
            .join("logs");
        Ok(Self {
            config_dir,
            log_dir,
        })
    }

    pub fn resolve_and_create() -> Result<Self, PlatformError> {
        let dirs = Self::resolve()?;
        dirs.create_dirs()?;
        Ok(dirs)
    }

    /// Directories rooted under `root`, for tests and portable installs.
    pub fn resolve_with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.join("config"),
            log_dir: app_dir.join("logs"),
        }
    }

    /// Use `config_dir` instead of the resolved one (the `--config` flag).
    pub fn with_config_dir(mut self, config_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = config_dir {
            self.config_dir = dir;
        }
        self
    }

    pub fn create_dirs(&self) -> Result<(), PlatformError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
