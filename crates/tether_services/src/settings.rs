//! Settings management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File looked up next to the entry script.
pub const SETTINGS_FILE: &str = "tether.json";

/// Environment variable that overrides the settings path.
pub const SETTINGS_ENV: &str = "TETHER_CONFIG";

/// Host settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub network: NetworkSettings,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub default_concurrency: usize,
    pub batch_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub max_frame_len: usize,
    pub default_buffer_size: usize,
    pub no_delay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Tokio worker threads; `None` keeps tokio's default.
    pub worker_threads: Option<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            default_concurrency: tether_core::scheduler::DEFAULT_CONCURRENCY,
            batch_concurrency: tether_core::scheduler::DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_frame_len: tether_core::frame::DEFAULT_MAX_FRAME_LEN,
            default_buffer_size: 64 * 1024,
            no_delay: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Settings {
    /// Parse settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve settings for an entry script.
    ///
    /// `$TETHER_CONFIG` wins when set and must exist. Otherwise `tether.json`
    /// in `script_dir` is used if present, else defaults.
    pub fn discover(script_dir: &Path) -> Result<Self, SettingsError> {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            let path = PathBuf::from(path);
            tracing::info!(path = %path.display(), env = SETTINGS_ENV, "loading settings from override");
            return Self::load(&path);
        }

        let path = script_dir.join(SETTINGS_FILE);
        if path.is_file() {
            tracing::info!(path = %path.display(), "loading settings");
            Self::load(&path)
        } else {
            tracing::debug!(dir = %script_dir.display(), "no settings file, using defaults");
            Ok(Self::default())
        }
    }
}
