//! Start-up reconciliation for fleetd.
//!
//! Before polling starts, the transition detector is seeded with the states
//! already persisted, so hooks for states reached before a restart are not
//! fired a second time.

use fleet_core::{Result, VmPool, VmState};
use std::sync::Arc;
use tracing::info;

/// Reconciles daemon state on startup.
pub struct StateReconciler {
    pool: Arc<VmPool>,
}

impl StateReconciler {
    pub fn new(pool: Arc<VmPool>) -> Self {
        Self { pool }
    }

    /// Seed the detector and summarize the pool.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        info!("Reconciling daemon state...");

        let mut report =
            ReconcileReport { primed: self.pool.prime_transitions().await?, ..Default::default() };

        for vm in self.pool.state().list_vms().await? {
            match vm.state {
                VmState::Pending | VmState::Hold => report.waiting += 1,
                VmState::Active => report.active += 1,
                VmState::Done => report.done += 1,
                _ => report.other += 1,
            }
        }

        // Samples that expired while the daemon was down
        report.expired_samples = self.pool.clean_expired_monitoring().await?;

        info!(
            primed = report.primed,
            waiting = report.waiting,
            active = report.active,
            done = report.done,
            expired_samples = report.expired_samples,
            "Reconciliation complete"
        );
        Ok(report)
    }
}

/// Report of reconciliation actions taken.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    /// VMs whose current state was loaded into the detector
    pub primed: usize,
    /// PENDING or HOLD
    pub waiting: usize,
    pub active: usize,
    pub done: usize,
    pub other: usize,
    pub expired_samples: u64,
}
