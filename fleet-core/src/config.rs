//! Configuration management.

use crate::error::{FleetError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Persistent configuration for the fleet daemon and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    /// Front-end hook scripts, for hooks run locally
    pub hook_dir: String,
    /// Scripts shipped to hosts; remote hooks resolve under `<remotes_dir>/hooks`
    pub remotes_dir: String,
    /// Shell used to reach a VM's host for remote hooks
    pub remote_shell: String,
    /// Hook rules, in registration order. Kept undecoded so that a malformed
    /// rule is rejected on its own by the hook registry.
    pub vm_hooks: Vec<Value>,
    pub max_concurrent_hooks: usize,
    /// Monitoring retention; 0 keeps no monitoring at all
    pub monitor_expiration_secs: u64,
    /// New VMs start in HOLD instead of PENDING
    pub submit_on_hold: bool,
    pub poll_interval_secs: u64,
    /// Periodic showback of the current month; 0 disables
    pub showback_interval_secs: u64,
    pub showback_batch_size: usize,
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: paths::db_path().to_string_lossy().to_string(),
            hook_dir: paths::hooks_dir().to_string_lossy().to_string(),
            remotes_dir: paths::remotes_dir().to_string_lossy().to_string(),
            remote_shell: "ssh".to_string(),
            vm_hooks: Vec::new(),
            max_concurrent_hooks: 8,
            monitor_expiration_secs: 4 * 3600,
            submit_on_hold: false,
            poll_interval_secs: 10,
            showback_interval_secs: 0,
            showback_batch_size: 1000,
            metrics_port: 9465,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a file; a missing file yields the defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| FleetError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| FleetError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }
}
