//! Centralized path configuration for the fleet.
//!
//! All data paths should go through this module to ensure consistency
//! between daemon and CLI, whether running as user or system service.

use std::path::PathBuf;

/// Get the fleet data directory.
///
/// Resolution order:
/// 1. `FLEET_DATA_DIR` environment variable
/// 2. `/var/lib/fleet` if it exists (system install)
/// 3. `~/.fleet` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLEET_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/fleet");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".fleet")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `FLEET_CONFIG_DIR` overrides; otherwise the data directory is used.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLEET_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    data_dir()
}

/// Get the database path.
///
/// `FLEET_DB_PATH` overrides the default `<data_dir>/fleet.db`.
pub fn db_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEET_DB_PATH") {
        return PathBuf::from(path);
    }
    data_dir().join("fleet.db")
}

/// Directory holding hooks executed on the front-end.
pub fn hooks_dir() -> PathBuf {
    data_dir().join("hooks")
}

/// Directory holding scripts copied to hosts; remote hooks live under `hooks/`.
pub fn remotes_dir() -> PathBuf {
    data_dir().join("remotes")
}
