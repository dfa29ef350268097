//! Local access to the fleet database.
//!
//! The CLI works on the same SQLite database as fleetd. Creation hooks fire
//! from the CLI since only it sees the allocation; state hooks are left to
//! the daemon's poll loop so that a change is never reported twice.

use anyhow::{Context, Result};
use fleet_core::{Config, HookSpec, ProcessExecutor, StateManager, VmPool};
use std::sync::Arc;

/// Pool handle for one CLI invocation.
pub struct FleetClient {
    pub pool: VmPool,
}

impl FleetClient {
    /// Open the configured database.
    pub async fn connect() -> Result<Self> {
        let mut config = Config::load().context("Failed to load configuration")?;

        let state = StateManager::new(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database {}", config.db_path))?;

        // Malformed rules are dropped here; `fleet hooks` reports them
        config.vm_hooks.retain(|value| HookSpec::from_value(value).is_ok_and(|s| s.is_create()));

        let executor = Arc::new(ProcessExecutor::new(config.remote_shell.clone()));
        let pool = VmPool::new(state, &config, executor).await?;

        Ok(Self { pool })
    }

    /// Let queued hooks finish before the process exits.
    pub async fn close(self) {
        self.pool.shutdown().await;
    }
}
