use anyhow::Context;
use fleet_core::observability::health;
use fleet_core::{init_observability, Config, HealthChecker, ProcessExecutor, StateManager, VmPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod reconcile;
mod shutdown;
mod tasks;

use reconcile::StateReconciler;
use shutdown::{shutdown_signal, ShutdownManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize observability FIRST
    init_observability("fleetd", &config.log_level, Some(config.metrics_port))
        .map_err(|e| anyhow::anyhow!("Failed to initialize observability: {}", e))?;

    info!("Fleet daemon starting");

    let health_checker =
        HealthChecker::with_subsystems(&[health::DATABASE, health::HOOKS, health::SHOWBACK]).await;

    info!("Initializing state manager at {}", config.db_path);
    let state = StateManager::new(&config.db_path)
        .await
        .context("Failed to initialize state manager")?;

    let executor = Arc::new(ProcessExecutor::new(config.remote_shell.clone()));
    let pool = Arc::new(VmPool::new(state, &config, executor).await?);
    if pool.registry().is_empty() && !config.vm_hooks.is_empty() {
        let message = Some("no valid hook rule".to_string());
        health_checker.update(health::HOOKS, health::HealthStatus::Degraded, message).await;
    }

    StateReconciler::new(pool.clone()).reconcile().await?;

    let shutdown = shutdown_signal();
    let mut stop = shutdown.subscribe();

    let mut tasks = vec![
        tasks::spawn_state_poll(
            pool.clone(),
            health_checker.clone(),
            Duration::from_secs(config.poll_interval_secs.max(1)),
            shutdown.subscribe(),
        ),
        tasks::spawn_monitor_cleanup(pool.clone(), shutdown.subscribe()),
        tasks::spawn_health_report(health_checker.clone(), shutdown.subscribe()),
    ];

    if config.showback_interval_secs > 0 {
        tasks.push(tasks::spawn_showback(
            pool.clone(),
            health_checker.clone(),
            Duration::from_secs(config.showback_interval_secs),
            shutdown.subscribe(),
        ));
    }

    info!(
        hooks = pool.registry().hooks().len(),
        healthy = health_checker.is_ready().await,
        "Fleet daemon ready"
    );

    // Wait for shutdown signal
    let _ = stop.recv().await;

    info!("Fleet daemon shutting down");
    ShutdownManager::new(pool).shutdown(tasks).await;
    Ok(())
}
