//! The VM pool: record store, hooks and accounting behind one handle.
//!
//! Every change to a VM record goes through [`VmPool`], which forwards
//! creations and state observations to the hook machinery. Hooks never block
//! a pool operation.

use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::hooks::{HookDispatcher, HookExecutor, HookRegistry, TransitionDetector};
use crate::showback::ShowbackEngine;
use crate::state::{StateManager, VmSearch};
use crate::types::{HistoryRecord, LcmState, NewVm, RecordFilter, ShowbackRange, Vm, VmState};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Pool of VM records with state hooks and showback.
pub struct VmPool {
    state: StateManager,
    registry: HookRegistry,
    /// Installed only when some hook fires on a state
    detector: Option<TransitionDetector>,
    dispatcher: HookDispatcher,
    showback: ShowbackEngine,
    submit_on_hold: bool,
    monitor_expiration_secs: u64,
}

impl VmPool {
    /// Build the pool from configuration.
    ///
    /// With a monitoring expiration of 0 all stored monitoring is wiped.
    #[instrument(skip_all)]
    pub async fn new(
        state: StateManager,
        config: &Config,
        executor: Arc<dyn HookExecutor>,
    ) -> Result<Self> {
        let registry =
            HookRegistry::from_specs(&config.vm_hooks, &config.hook_dir, &config.remotes_dir);
        let detector = registry.needs_state_tracking().then(TransitionDetector::new);

        if config.monitor_expiration_secs == 0 {
            let removed = state.delete_all_monitoring().await?;
            info!(removed, "Monitoring disabled, stored samples removed");
        }

        Ok(Self {
            showback: ShowbackEngine::new(state.clone(), config.showback_batch_size),
            dispatcher: HookDispatcher::new(executor, config.max_concurrent_hooks),
            state,
            registry,
            detector,
            submit_on_hold: config.submit_on_hold,
            monitor_expiration_secs: config.monitor_expiration_secs,
        })
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// VMs whose last emitted state is remembered.
    pub fn tracked_vms(&self) -> usize {
        self.detector.as_ref().map_or(0, TransitionDetector::len)
    }

    // ========================
    // Allocation & state
    // ========================

    /// Insert a new VM, in HOLD when requested or when the pool submits on
    /// hold, PENDING otherwise. Creation hooks fire right after.
    #[instrument(skip(self, vm), fields(name = %vm.name))]
    pub async fn allocate(&self, vm: &NewVm, on_hold: bool) -> Result<i64> {
        let state = if self.submit_on_hold || on_hold { VmState::Hold } else { VmState::Pending };

        let oid = self.state.insert_vm(vm, state, unix_now()).await?;
        let vm = self.state.get_vm(oid).await?;
        info!(vm_id = oid, state = %state, "VM allocated");

        self.dispatch_on_create(&vm);
        self.dispatch_on_observation(&vm);

        Ok(oid)
    }

    /// Persist a new state pair and report it to the hooks.
    ///
    /// Entering DONE stamps the end time. Returns the number of hooks launched.
    #[instrument(skip(self))]
    pub async fn update_state(
        &self,
        vm_id: i64,
        state: VmState,
        lcm_state: LcmState,
    ) -> Result<usize> {
        let vm = {
            let mut vm = self
                .state
                .get_vm_locked(vm_id)
                .await?
                .ok_or(FleetError::VmNotFound { vm_id })?;

            vm.state = state;
            vm.lcm_state = lcm_state;
            if state == VmState::Done && vm.etime == 0 {
                vm.etime = unix_now();
            }
            self.state.update_vm(&vm).await?;
            vm.into_inner()
        };

        Ok(self.dispatch_on_observation(&vm))
    }

    /// Launch the creation hooks of a VM.
    pub fn dispatch_on_create(&self, vm: &Vm) -> usize {
        let launched = self.dispatcher.dispatch_create(self.registry.on_create(), vm);
        if launched > 0 {
            debug!(vm_id = vm.oid, launched, "Creation hooks dispatched");
        }
        launched
    }

    /// Report the current state of a VM. Hooks fire only when the state pair
    /// changed since the last report.
    pub fn dispatch_on_observation(&self, vm: &Vm) -> usize {
        let Some(detector) = self.detector.as_ref() else {
            return 0;
        };
        let Some(edge) = detector.observe(vm.oid, vm.transition_key()) else {
            if vm.state == VmState::Done {
                detector.forget(vm.oid);
            }
            return 0;
        };

        metrics::counter!("fleet_vm_transitions_total", "state" => edge.current.to_string())
            .increment(1);

        let launched =
            self.dispatcher.dispatch_transition(self.registry.matching(&edge.current), vm, &edge);
        debug!(vm_id = vm.oid, state = %edge.current, launched, "VM state changed");

        // A VM is never observed after DONE
        if vm.state == VmState::Done {
            detector.forget(vm.oid);
        }

        launched
    }

    /// Re-observe the persisted state of one VM.
    pub async fn observe(&self, vm_id: i64) -> Result<usize> {
        let vm = self.state.get_vm(vm_id).await?;
        Ok(self.dispatch_on_observation(&vm))
    }

    /// Re-observe every VM not yet DONE, plus every VM the detector still
    /// remembers. Returns the number of hooks launched.
    ///
    /// State may be changed by another process over the same database, so a
    /// remembered VM found in DONE gets its DONE edge here and is then
    /// forgotten. A remembered VM whose record is gone is forgotten.
    #[instrument(skip(self))]
    pub async fn observe_all(&self) -> Result<usize> {
        let Some(detector) = self.detector.as_ref() else {
            return Ok(0);
        };

        let search = VmSearch { exclude_states: vec![VmState::Done], ..Default::default() };
        let mut ids: BTreeSet<i64> = self.state.search_vms(&search).await?.into_iter().collect();
        ids.extend(detector.tracked());

        let mut launched = 0;
        for vm_id in ids {
            match self.state.find_vm(vm_id).await? {
                Some(vm) => launched += self.dispatch_on_observation(&vm),
                None => {
                    if detector.forget(vm_id).is_some() {
                        debug!(vm_id, "Purged VM forgotten");
                    }
                }
            }
        }

        Ok(launched)
    }

    /// Seed the transition detector with the persisted states, so that a
    /// restart does not fire hooks again for states already reached.
    #[instrument(skip(self))]
    pub async fn prime_transitions(&self) -> Result<usize> {
        let Some(detector) = self.detector.as_ref() else {
            return Ok(0);
        };

        let mut primed = 0;
        for vm in self.state.list_vms().await? {
            if vm.state != VmState::Done {
                detector.prime(vm.oid, vm.transition_key());
                primed += 1;
            }
        }

        info!(primed, "Transition detector primed");
        Ok(primed)
    }

    // ========================
    // Placement history
    // ========================

    /// Record the VM as running on `hostname` from `stime`, opening a new
    /// history interval. An interval still open is closed at `stime`.
    #[instrument(skip(self))]
    pub async fn deploy(&self, vm_id: i64, hostname: &str, stime: i64) -> Result<HistoryRecord> {
        let mut vm =
            self.state.get_vm_locked(vm_id).await?.ok_or(FleetError::VmNotFound { vm_id })?;

        match self.state.close_history(vm_id, stime).await {
            Ok(previous) => debug!(vm_id, seq = previous.seq, "Previous interval closed"),
            Err(FleetError::NoOpenHistory { .. }) => {}
            Err(e) => return Err(e),
        }

        let record = HistoryRecord {
            oid: vm_id,
            seq: self.state.next_history_seq(vm_id).await?,
            hostname: hostname.to_string(),
            stime,
            etime: 0,
            cpu: vm.template.cpu,
            memory: vm.template.memory,
            cpu_cost: vm.template.cpu_cost,
            memory_cost: vm.template.memory_cost,
        };
        self.state.insert_history(&record).await?;

        vm.hostname = Some(hostname.to_string());
        self.state.update_vm(&vm).await?;

        info!(vm_id, hostname, seq = record.seq, "VM deployed");
        Ok(record)
    }

    /// Close the open history interval of a VM at `etime`.
    pub async fn close_history(&self, vm_id: i64, etime: i64) -> Result<HistoryRecord> {
        self.state.close_history(vm_id, etime).await
    }

    // ========================
    // Searches & dumps
    // ========================

    /// ACTIVE VMs in RUNNING or UNKNOWN last polled at or before `last_poll`,
    /// least recently polled first.
    pub async fn get_running(&self, limit: i64, last_poll: i64) -> Result<Vec<i64>> {
        let search = VmSearch {
            states: vec![VmState::Active],
            lcm_states: vec![LcmState::Running, LcmState::Unknown],
            polled_before: Some(last_poll),
            order_by_last_poll: true,
            limit: Some(limit),
            ..Default::default()
        };
        self.state.search_vms(&search).await
    }

    /// VMs waiting for placement.
    pub async fn get_pending(&self) -> Result<Vec<i64>> {
        let search = VmSearch { states: vec![VmState::Pending], ..Default::default() };
        self.state.search_vms(&search).await
    }

    /// Accounting document: history intervals intersecting `[start, end)`.
    pub async fn dump_acct(
        &self,
        filter: RecordFilter,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Value> {
        self.state.dump_history(filter, start, end).await
    }

    pub async fn dump_showback(&self, filter: RecordFilter, range: ShowbackRange) -> Result<Value> {
        self.state.dump_showback(filter, range).await
    }

    // ========================
    // Monitoring
    // ========================

    /// Store a monitoring sample. Dropped when monitoring is disabled.
    pub async fn record_monitoring(
        &self,
        vm_id: i64,
        last_poll: i64,
        sample: &Value,
    ) -> Result<()> {
        if self.monitor_expiration_secs == 0 {
            return Ok(());
        }
        self.state.insert_monitoring(vm_id, last_poll, sample).await
    }

    pub async fn dump_monitoring(&self, filter: RecordFilter) -> Result<Value> {
        self.state.dump_monitoring(filter).await
    }

    /// Remove samples older than the retention period.
    pub async fn clean_expired_monitoring(&self) -> Result<u64> {
        if self.monitor_expiration_secs == 0 {
            return Ok(0);
        }
        let expired_before = unix_now() - self.monitor_expiration_secs as i64;
        let removed = self.state.delete_monitoring_before(expired_before).await?;
        if removed > 0 {
            debug!(removed, "Expired monitoring removed");
        }
        Ok(removed)
    }

    pub async fn clean_all_monitoring(&self) -> Result<u64> {
        self.state.delete_all_monitoring().await
    }

    // ========================
    // Lifecycle
    // ========================

    /// Delete a VM record. Its history and showback rows are kept.
    pub async fn purge(&self, vm_id: i64) -> Result<()> {
        self.state.delete_vm(vm_id).await?;
        if let Some(detector) = self.detector.as_ref() {
            detector.forget(vm_id);
        }
        info!(vm_id, "VM purged");
        Ok(())
    }

    /// Recompute the showback ledger over `range`. Returns the rows written.
    pub async fn calculate_showback(&self, range: ShowbackRange) -> Result<usize> {
        self.showback.calculate(range).await.map_err(|e| {
            warn!("Showback failed: {}", e);
            e
        })
    }

    /// Stop accepting hooks and wait for the queued ones to finish.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
