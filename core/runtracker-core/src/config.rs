//! Runtime configuration and storage layout.
//!
//! Everything the tracker writes lives under one root (default `~/.runtracker`,
//! overridable with `RUNTRACKER_HOME` or `[storage] root`). Tests point
//! [`StoragePaths::with_root`] at a temp dir.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};

pub const HOME_ENV: &str = "RUNTRACKER_HOME";
const DEFAULT_ROOT_DIR: &str = ".runtracker";
const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_PROVIDER: &str = "gps";
pub const DEFAULT_TEST_PROVIDER: &str = "TEST_PROVIDER";
const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct StorageConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Re-begin delivery on open when a run was left current.
    #[serde(default = "default_true")]
    pub resume_on_start: bool,
    /// Seed a new run with the source's cached fix, re-timestamped to now.
    #[serde(default = "default_true")]
    pub seed_from_last_known: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resume_on_start: true,
            seed_from_last_known: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    #[serde(default = "default_provider")]
    pub default: String,
    #[serde(default = "default_test_provider")]
    pub test_provider: String,
    #[serde(default = "default_true")]
    pub prefer_test_provider: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default: default_provider(),
            test_provider: default_test_provider(),
            prefer_test_provider: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct TrackerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl TrackerConfig {
    /// Loads `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs_err::read_to_string(path)
            .map_err(|err| TrackerError::io(format!("Failed to read {}", path.display()), err))?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        toml::from_str::<TrackerConfig>(content).map_err(|err| TrackerError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_test_provider() -> String {
    DEFAULT_TEST_PROVIDER.to_string()
}

/// File locations for one tracker installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// `$RUNTRACKER_HOME`, else `~/.runtracker`.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or(TrackerError::HomeDirNotFound)?;
        Ok(Self::with_root(home.join(DEFAULT_ROOT_DIR)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Re-roots at `[storage] root` when the config sets one.
    pub fn apply_config(self, config: &TrackerConfig) -> Self {
        match &config.storage.root {
            Some(root) => Self::with_root(root.clone()),
            None => self,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Relational store (`run` and `location` tables).
    pub fn database_file(&self) -> PathBuf {
        self.root.join("runs.sqlite")
    }

    /// Key-value session marker.
    pub fn marker_file(&self) -> PathBuf {
        self.root.join("runs.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
