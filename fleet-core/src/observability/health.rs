//! Health of the daemon's subsystems.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Record store reachability.
pub const DATABASE: &str = "database";
/// Hook registry and dispatcher.
pub const HOOKS: &str = "hooks";
/// Periodic showback runs.
pub const SHOWBACK: &str = "showback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot of every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

impl HealthReport {
    /// One line naming the subsystems that are not healthy, e.g.
    /// `showback=degraded (write failed)`.
    pub fn summary(&self) -> String {
        self.subsystems
            .iter()
            .filter(|s| s.status != HealthStatus::Healthy)
            .map(|s| match &s.message {
                Some(message) => format!("{}={} ({})", s.name, s.status, message),
                None => format!("{}={}", s.name, s.status),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl HealthStatus {
    /// Gauge value: 0 healthy, 1 degraded, 2 unhealthy.
    pub fn level(&self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Degraded => 1.0,
            Self::Unhealthy => 2.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Unix time of the last status change
    pub updated_at: i64,
}

/// Tracks the status of named subsystems.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker tracking the given subsystems, all healthy.
    pub async fn with_subsystems(names: &[&str]) -> Self {
        let checker = Self::new();
        for name in names {
            checker.register(name).await;
        }
        checker
    }

    /// Start tracking a subsystem. Registering twice is a no-op.
    pub async fn register(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().all(|s| s.name != name) {
            subsystems.push(SubsystemHealth {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                message: None,
                updated_at: chrono::Utc::now().timestamp(),
            });
        }
    }

    /// Set the status of a tracked subsystem. Unknown names are ignored.
    pub async fn update(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            if subsystem.status != status {
                tracing::info!(subsystem = name, ?status, "Health changed");
            }
            subsystem.status = status;
            subsystem.message = message;
            subsystem.updated_at = chrono::Utc::now().timestamp();
        }
    }

    pub async fn healthy(&self, name: &str) {
        self.update(name, HealthStatus::Healthy, None).await;
    }

    /// Fold the outcome of an operation into a subsystem's status.
    pub async fn record<T, E: std::fmt::Display>(
        &self,
        name: &str,
        result: &std::result::Result<T, E>,
        on_error: HealthStatus,
    ) {
        match result {
            Ok(_) => self.healthy(name).await,
            Err(e) => self.update(name, on_error, Some(e.to_string())).await,
        }
    }

    /// Worst status across subsystems.
    pub async fn report(&self) -> HealthReport {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.report().await.status == HealthStatus::Healthy
    }
}
