//! Background loops: state polling, monitoring cleanup and periodic showback.

use chrono::Datelike;
use fleet_core::observability::health::{self, HealthStatus};
use fleet_core::observability::metrics::{set_health, set_tracked_vms};
use fleet_core::{HealthChecker, ShowbackRange, VmPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MONITOR_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Run `tick` every `period` until shutdown is signalled.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, period = ?period, "Background task started");

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.recv() => break,
            }
        }

        debug!(task = name, "Background task stopped");
    })
}

/// Re-observe every live VM so that state changes reach the hooks.
pub fn spawn_state_poll(
    pool: Arc<VmPool>,
    checker: HealthChecker,
    period: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    spawn_loop("state-poll", period, shutdown, move || {
        let pool = pool.clone();
        let checker = checker.clone();
        async move {
            let result = pool.observe_all().await;
            match &result {
                Ok(launched) if *launched > 0 => debug!(launched, "Hooks launched by poll"),
                Ok(_) => {}
                Err(e) => warn!("State poll failed: {}", e),
            }
            checker.record(health::DATABASE, &result, HealthStatus::Unhealthy).await;
            set_tracked_vms(pool.tracked_vms());
        }
    })
}

/// Drop monitoring samples past their retention period.
pub fn spawn_monitor_cleanup(
    pool: Arc<VmPool>,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    spawn_loop("monitor-cleanup", MONITOR_CLEANUP_INTERVAL, shutdown, move || {
        let pool = pool.clone();
        async move {
            if let Err(e) = pool.clean_expired_monitoring().await {
                warn!("Monitoring cleanup failed: {}", e);
            }
        }
    })
}

/// Recompute the showback of the current month.
pub fn spawn_showback(
    pool: Arc<VmPool>,
    checker: HealthChecker,
    period: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    spawn_loop("showback", period, shutdown, move || {
        let pool = pool.clone();
        let checker = checker.clone();
        async move {
            let today = chrono::Local::now();
            let range = ShowbackRange::month(today.year(), today.month());

            let result = pool.calculate_showback(range).await;
            if let Ok(rows) = &result {
                info!(rows, month = today.month(), year = today.year(), "Periodic showback done");
            }
            checker.record(health::SHOWBACK, &result, HealthStatus::Degraded).await;
        }
    })
}

/// Export subsystem health and warn while any subsystem is not healthy.
pub fn spawn_health_report(
    checker: HealthChecker,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    spawn_loop("health-report", HEALTH_REPORT_INTERVAL, shutdown, move || {
        let checker = checker.clone();
        async move {
            let report = checker.report().await;
            set_health(&report);
            if report.status != HealthStatus::Healthy {
                warn!(status = %report.status, "Daemon not healthy: {}", report.summary());
            }
        }
    })
}
