//! Execution history and monitoring types.

use serde::{Deserialize, Serialize};

/// One execution interval of a VM on a host.
///
/// Capacity and pricing are a snapshot of the VM template taken when the
/// interval opened. `etime == 0` marks an interval that is still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HistoryRecord {
    /// VM the interval belongs to
    pub oid: i64,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub stime: i64,
    #[serde(default)]
    pub etime: i64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub cpu_cost: f64,
    #[serde(default)]
    pub memory_cost: f64,
}

impl HistoryRecord {
    pub fn is_open(&self) -> bool {
        self.etime == 0
    }
}

/// Restricts history and showback dumps to a VM or an owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter {
    pub vm_id: Option<i64>,
    pub uid: Option<i64>,
}

impl RecordFilter {
    pub fn vm(vm_id: i64) -> Self {
        Self { vm_id: Some(vm_id), uid: None }
    }

    pub fn owner(uid: i64) -> Self {
        Self { vm_id: None, uid: Some(uid) }
    }
}
