//! Metric names and descriptions.
//!
//! Counters end in `_total`, durations are histograms in `_seconds`.

use super::health::HealthReport;
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};

/// Describe every metric emitted by the fleet so they show up in `/metrics`
/// with help text.
pub fn register_core_metrics() {
    // Hooks
    describe_counter!("fleet_hooks_dispatched_total", "Hook jobs queued (by hook)");
    describe_counter!("fleet_hook_failures_total", "Hook commands that failed to run (by hook)");
    describe_histogram!("fleet_hook_duration_seconds", "Hook command run time");
    describe_counter!("fleet_vm_transitions_total", "VM state changes seen (by state)");
    describe_gauge!("fleet_vms_tracked", "VMs whose last state is remembered");

    // Showback
    describe_counter!("fleet_showback_runs_total", "Showback computations started");
    describe_counter!("fleet_showback_rows_total", "Showback rows written");
    describe_counter!("fleet_showback_failures_total", "Showback runs aborted on write errors");
    describe_histogram!("fleet_showback_duration_seconds", "Showback computation time");

    // Database
    describe_counter!("fleet_db_errors_total", "Failed record store operations (by operation)");

    // Health
    describe_gauge!(
        "fleet_health_status",
        "Subsystem health: 0 healthy, 1 degraded, 2 unhealthy (by subsystem)"
    );
}

pub fn set_tracked_vms(count: usize) {
    gauge!("fleet_vms_tracked").set(count as f64);
}

/// Export every subsystem of a health report as a gauge.
pub fn set_health(report: &HealthReport) {
    for subsystem in &report.subsystems {
        gauge!("fleet_health_status", "subsystem" => subsystem.name.clone())
            .set(subsystem.status.level());
    }
}
