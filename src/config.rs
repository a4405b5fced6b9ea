use crate::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".svcharness.yml";

/// Defaults shared by services and groups.
///
/// Every field is optional in the YAML file; missing fields keep their
/// built-in values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Host probed for readiness and used in service URLs
    pub host: String,
    /// How long `start` waits for the port to accept connections
    pub start_timeout_ms: u64,
    /// How long `stop` waits for the process to exit after the interrupt
    pub stop_timeout_ms: u64,
    /// Pause between readiness connect attempts
    pub poll_interval_ms: u64,
    /// Worker threads used by service groups
    pub group_workers: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            start_timeout_ms: 5_000,
            stop_timeout_ms: 5_000,
            poll_interval_ms: 10,
            group_workers: 7,
        }
    }
}

impl HarnessConfig {
    /// Load config from .svcharness.yml in the given directory
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            // No config file, return defaults
            return Ok(HarnessConfig::default());
        }

        Self::from_file(&config_path)
    }

    /// Load config from an explicit file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: HarnessConfig = serde_yml::from_str(&content).map_err(|e| {
            HarnessError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Find the nearest directory (starting at `start_path`) holding a config file
    pub fn find_config_dir(start_path: &Path) -> Option<PathBuf> {
        let mut current = start_path;

        loop {
            if current.join(CONFIG_FILE_NAME).exists() {
                return Some(current.to_path_buf());
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Load the nearest config walking up from `start_path`, or defaults
    pub fn discover(start_path: &Path) -> Result<Self> {
        match Self::find_config_dir(start_path) {
            Some(dir) => Self::load(&dir),
            None => Ok(HarnessConfig::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.group_workers == 0 {
            return Err(HarnessError::Config(
                "group_workers must be at least 1".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(HarnessError::Config("host must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
