//! State management with SQLite persistence.
//!
//! The StateManager is the record store of the VM pool:
//! - VM records and their lifecycle state
//! - Execution history intervals
//! - Monitoring samples
//! - The showback ledger
//!
//! Records can be read under an exclusive per-record lock (see
//! [`StateManager::get_vm_locked`]); the lock lives in process memory and is
//! released when the returned guard is dropped.

use crate::error::{FleetError, Result};
use crate::types::{
    HistoryRecord, LcmState, NewVm, RecordFilter, ShowbackRange, ShowbackRecord, Vm, VmState,
};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, QueryBuilder, Row};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
    locks: Arc<RecordLocks>,
}

/// Per-record exclusive locks, created on demand.
#[derive(Default)]
struct RecordLocks {
    inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    async fn lock(&self, oid: i64) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(oid).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Drop the lock of a record unless a guard or a waiter still holds it.
    fn release(&self, oid: i64) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&oid).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            map.remove(&oid);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A VM record read under its record lock.
///
/// Mutations are not persisted until passed to [`StateManager::update_vm`].
pub struct LockedVm {
    vm: Vm,
    _guard: OwnedMutexGuard<()>,
}

impl LockedVm {
    /// Release the lock and keep a copy of the record.
    pub fn into_inner(self) -> Vm {
        self.vm
    }
}

impl Deref for LockedVm {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.vm
    }
}

impl DerefMut for LockedVm {
    fn deref_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

/// Predicate for [`StateManager::search_vms`].
#[derive(Debug, Clone, Default)]
pub struct VmSearch {
    /// Match any of these states (empty = any)
    pub states: Vec<VmState>,
    /// Exclude these states
    pub exclude_states: Vec<VmState>,
    /// Match any of these LCM states (empty = any)
    pub lcm_states: Vec<LcmState>,
    /// Only VMs polled at or before this time
    pub polled_before: Option<i64>,
    /// Oldest poll first instead of oid order
    pub order_by_last_poll: bool,
    pub limit: Option<i64>,
}

fn db_err(e: sqlx::Error) -> FleetError {
    FleetError::DatabaseError(e.to_string())
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");

        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FleetError::InvalidConfig {
                        reason: format!("Failed to create directory {}: {}", parent.display(), e),
                    }
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            FleetError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(db_err)?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // Every in-memory connection is its own database
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;

        let manager = Self { pool, locks: Arc::new(RecordLocks::default()) };

        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // VM Operations
    // ========================

    /// Insert a new VM and return its oid.
    #[instrument(skip(self, vm), fields(name = %vm.name))]
    pub async fn insert_vm(&self, vm: &NewVm, state: VmState, stime: i64) -> Result<i64> {
        let template_json = serde_json::to_string(&vm.template).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to serialize template: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO vms (name, uid, gid, uname, gname, state, lcm_state, template, stime)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.name)
        .bind(vm.uid)
        .bind(vm.gid)
        .bind(&vm.uname)
        .bind(&vm.gname)
        .bind(state.code())
        .bind(LcmState::LcmInit.code())
        .bind(template_json)
        .bind(stime)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::counter!("fleet_db_errors_total", "operation" => "insert_vm").increment(1);
            db_err(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a VM by oid.
    #[instrument(skip(self))]
    pub async fn get_vm(&self, oid: i64) -> Result<Vm> {
        self.find_vm(oid).await?.ok_or(FleetError::VmNotFound { vm_id: oid })
    }

    /// Get a VM by oid, `None` when it does not exist.
    pub async fn find_vm(&self, oid: i64) -> Result<Option<Vm>> {
        let row = sqlx::query("SELECT * FROM vms WHERE oid = ?")
            .bind(oid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                metrics::counter!("fleet_db_errors_total", "operation" => "get_vm").increment(1);
                db_err(e)
            })?;

        row.map(|row| self.row_to_vm(row)).transpose()
    }

    /// Get a VM and hold its record lock until the result is dropped.
    ///
    /// No lock is kept for a record that does not exist.
    pub async fn get_vm_locked(&self, oid: i64) -> Result<Option<LockedVm>> {
        let guard = self.locks.lock(oid).await;
        match self.find_vm(oid).await {
            Ok(Some(vm)) => Ok(Some(LockedVm { vm, _guard: guard })),
            other => {
                drop(guard);
                self.locks.release(oid);
                other.map(|_| None)
            }
        }
    }

    /// List all VMs.
    #[instrument(skip(self))]
    pub async fn list_vms(&self) -> Result<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms ORDER BY oid")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(|row| self.row_to_vm(row)).collect()
    }

    /// Return the oids of the VMs matching a predicate.
    #[instrument(skip(self))]
    pub async fn search_vms(&self, search: &VmSearch) -> Result<Vec<i64>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT oid FROM vms WHERE 1 = 1");

        if !search.states.is_empty() {
            query.push(" AND state IN (");
            let mut list = query.separated(", ");
            for state in &search.states {
                list.push_bind(state.code());
            }
            list.push_unseparated(")");
        }

        if !search.exclude_states.is_empty() {
            query.push(" AND state NOT IN (");
            let mut list = query.separated(", ");
            for state in &search.exclude_states {
                list.push_bind(state.code());
            }
            list.push_unseparated(")");
        }

        if !search.lcm_states.is_empty() {
            query.push(" AND lcm_state IN (");
            let mut list = query.separated(", ");
            for state in &search.lcm_states {
                list.push_bind(state.code());
            }
            list.push_unseparated(")");
        }

        if let Some(polled_before) = search.polled_before {
            query.push(" AND last_poll <= ").push_bind(polled_before);
        }

        if search.order_by_last_poll {
            query.push(" ORDER BY last_poll ASC");
        } else {
            query.push(" ORDER BY oid ASC");
        }

        if let Some(limit) = search.limit {
            query.push(" LIMIT ").push_bind(limit);
        }

        let rows = query.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.into_iter().map(|row| row.get::<i64, _>("oid")).collect())
    }

    /// Persist the mutable columns of a VM record.
    #[instrument(skip(self, vm), fields(vm_id = vm.oid))]
    pub async fn update_vm(&self, vm: &Vm) -> Result<()> {
        let template_json = serde_json::to_string(&vm.template).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to serialize template: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE vms
            SET name = ?, state = ?, lcm_state = ?, template = ?, hostname = ?,
                last_poll = ?, etime = ?
            WHERE oid = ?
            "#,
        )
        .bind(&vm.name)
        .bind(vm.state.code())
        .bind(vm.lcm_state.code())
        .bind(template_json)
        .bind(&vm.hostname)
        .bind(vm.last_poll)
        .bind(vm.etime)
        .bind(vm.oid)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::counter!("fleet_db_errors_total", "operation" => "update_vm").increment(1);
            db_err(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(FleetError::VmNotFound { vm_id: vm.oid });
        }

        Ok(())
    }

    /// Delete a VM record. History and showback rows are kept.
    #[instrument(skip(self))]
    pub async fn delete_vm(&self, oid: i64) -> Result<()> {
        {
            let _guard = self.locks.lock(oid).await;
            sqlx::query("DELETE FROM vms WHERE oid = ?")
                .bind(oid)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    metrics::counter!("fleet_db_errors_total", "operation" => "delete_vm")
                        .increment(1);
                    db_err(e)
                })?;
        }
        self.locks.release(oid);

        Ok(())
    }

    fn row_to_vm(&self, row: SqliteRow) -> Result<Vm> {
        let template_json: String = row.get("template");
        let template = serde_json::from_str(&template_json).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to deserialize template: {}", e))
        })?;

        Ok(Vm {
            oid: row.get("oid"),
            name: row.get("name"),
            uid: row.get("uid"),
            uname: row.get("uname"),
            gid: row.get("gid"),
            gname: row.get("gname"),
            state: VmState::from_code(row.get("state"))?,
            lcm_state: LcmState::from_code(row.get("lcm_state"))?,
            template,
            hostname: row.get("hostname"),
            last_poll: row.get("last_poll"),
            stime: row.get("stime"),
            etime: row.get("etime"),
        })
    }

    // ========================
    // History Operations
    // ========================

    /// Sequence number the next history record of a VM should use.
    pub async fn next_history_seq(&self, vm_id: i64) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM history WHERE vid = ?")
            .bind(vm_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(max.map_or(0, |seq| seq + 1))
    }

    /// Insert a history record.
    #[instrument(skip(self, record), fields(vm_id = record.oid, seq = record.seq))]
    pub async fn insert_history(&self, record: &HistoryRecord) -> Result<()> {
        let body = serde_json::to_string(record).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to serialize history: {}", e))
        })?;

        sqlx::query("INSERT INTO history (vid, seq, stime, etime, body) VALUES (?, ?, ?, ?, ?)")
            .bind(record.oid)
            .bind(record.seq)
            .bind(record.stime)
            .bind(record.etime)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                metrics::counter!("fleet_db_errors_total", "operation" => "insert_history")
                    .increment(1);
                db_err(e)
            })?;

        Ok(())
    }

    /// Close the open history record of a VM.
    #[instrument(skip(self))]
    pub async fn close_history(&self, vm_id: i64, etime: i64) -> Result<HistoryRecord> {
        let row = sqlx::query(
            "SELECT body FROM history WHERE vid = ? AND etime = 0 ORDER BY seq DESC LIMIT 1",
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(FleetError::NoOpenHistory { vm_id })?;

        let body: String = row.get("body");
        let mut record: HistoryRecord = serde_json::from_str(&body).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to deserialize history: {}", e))
        })?;
        record.etime = etime;

        let body = serde_json::to_string(&record).map_err(|e| {
            FleetError::DatabaseError(format!("Failed to serialize history: {}", e))
        })?;

        sqlx::query("UPDATE history SET etime = ?, body = ? WHERE vid = ? AND seq = ?")
            .bind(etime)
            .bind(body)
            .bind(vm_id)
            .bind(record.seq)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(record)
    }

    /// Earliest start time across all history records.
    pub async fn min_history_stime(&self) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT MIN(stime) FROM history WHERE stime > 0")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Dump the history records intersecting `[time_start, time_end)`.
    ///
    /// Open records (`etime = 0`) always intersect. The document has the form
    /// `{"HISTORY_RECORDS": [<body>, ...]}` ordered by VM and sequence.
    #[instrument(skip(self))]
    pub async fn dump_history(
        &self,
        filter: RecordFilter,
        time_start: Option<i64>,
        time_end: Option<i64>,
    ) -> Result<Value> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT history.body FROM history LEFT JOIN vms ON history.vid = vms.oid WHERE 1 = 1",
        );

        if let Some(vm_id) = filter.vm_id {
            query.push(" AND history.vid = ").push_bind(vm_id);
        }

        if let Some(uid) = filter.uid {
            query.push(" AND vms.uid = ").push_bind(uid);
        }

        if let Some(start) = time_start {
            query.push(" AND (history.etime > ").push_bind(start).push(" OR history.etime = 0)");
        }

        if let Some(end) = time_end {
            query.push(" AND history.stime < ").push_bind(end);
        }

        query.push(" ORDER BY history.vid, history.seq");

        let rows = query.build().fetch_all(&self.pool).await.map_err(db_err)?;

        Ok(serde_json::json!({ "HISTORY_RECORDS": bodies(rows) }))
    }

    // ========================
    // Monitoring Operations
    // ========================

    /// Store a monitoring sample and stamp the VM's last poll.
    #[instrument(skip(self, body))]
    pub async fn insert_monitoring(&self, vm_id: i64, last_poll: i64, body: &Value) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO vm_monitoring (vmid, last_poll, body) VALUES (?, ?, ?)")
            .bind(vm_id)
            .bind(last_poll)
            .bind(body.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query("UPDATE vms SET last_poll = ? WHERE oid = ?")
            .bind(last_poll)
            .bind(vm_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    /// Dump monitoring samples as `{"MONITORING_DATA": [...]}`.
    #[instrument(skip(self))]
    pub async fn dump_monitoring(&self, filter: RecordFilter) -> Result<Value> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT vm_monitoring.body FROM vm_monitoring \
             INNER JOIN vms ON vm_monitoring.vmid = vms.oid WHERE 1 = 1",
        );

        if let Some(vm_id) = filter.vm_id {
            query.push(" AND vm_monitoring.vmid = ").push_bind(vm_id);
        }

        if let Some(uid) = filter.uid {
            query.push(" AND vms.uid = ").push_bind(uid);
        }

        query.push(" ORDER BY vm_monitoring.vmid, vm_monitoring.last_poll");

        let rows = query.build().fetch_all(&self.pool).await.map_err(db_err)?;

        Ok(serde_json::json!({ "MONITORING_DATA": bodies(rows) }))
    }

    /// Delete monitoring samples older than `max_last_poll`.
    pub async fn delete_monitoring_before(&self, max_last_poll: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM vm_monitoring WHERE last_poll < ?")
            .bind(max_last_poll)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    /// Delete every monitoring sample.
    pub async fn delete_all_monitoring(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM vm_monitoring").execute(&self.pool).await.map_err(db_err)?;

        Ok(result.rows_affected())
    }

    // ========================
    // Showback Operations
    // ========================

    /// Insert or replace a batch of showback rows in one statement.
    #[instrument(skip(self, records), fields(rows = records.len()))]
    pub async fn upsert_showback(&self, records: &[ShowbackRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let body = serde_json::to_string(record).map_err(|e| {
                FleetError::DatabaseError(format!("Failed to serialize showback: {}", e))
            })?;
            rows.push((record.vmid, record.year, i64::from(record.month), body));
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT OR REPLACE INTO vm_showback (vmid, year, month, body) ");
        query.push_values(rows, |mut row, (vmid, year, month, body)| {
            row.push_bind(vmid).push_bind(year).push_bind(month).push_bind(body);
        });

        let result = query.build().execute(&self.pool).await.map_err(|e| {
            metrics::counter!("fleet_db_errors_total", "operation" => "upsert_showback")
                .increment(1);
            db_err(e)
        })?;

        Ok(result.rows_affected())
    }

    /// Dump showback rows as `{"SHOWBACK_RECORDS": [...]}`, ordered by
    /// year, month and VM.
    #[instrument(skip(self))]
    pub async fn dump_showback(&self, filter: RecordFilter, range: ShowbackRange) -> Result<Value> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT vm_showback.body FROM vm_showback \
             LEFT JOIN vms ON vm_showback.vmid = vms.oid WHERE 1 = 1",
        );

        if let Some(vm_id) = filter.vm_id {
            query.push(" AND vm_showback.vmid = ").push_bind(vm_id);
        }

        if let Some(uid) = filter.uid {
            query.push(" AND vms.uid = ").push_bind(uid);
        }

        if let Some(start) = range.start {
            query
                .push(" AND (year > ")
                .push_bind(start.year)
                .push(" OR (year = ")
                .push_bind(start.year)
                .push(" AND month >= ")
                .push_bind(i64::from(start.month))
                .push("))");
        }

        if let Some(end) = range.end {
            query
                .push(" AND (year < ")
                .push_bind(end.year)
                .push(" OR (year = ")
                .push_bind(end.year)
                .push(" AND month <= ")
                .push_bind(i64::from(end.month))
                .push("))");
        }

        query.push(" ORDER BY year, month, vm_showback.vmid");

        let rows = query.build().fetch_all(&self.pool).await.map_err(db_err)?;

        Ok(serde_json::json!({ "SHOWBACK_RECORDS": bodies(rows) }))
    }
}

/// Decode stored JSON bodies; a body that is not JSON is passed through as a
/// string so readers can skip it.
fn bodies(rows: Vec<SqliteRow>) -> Vec<Value> {
    rows.into_iter()
        .map(|row| {
            let body: String = row.get(0);
            match serde_json::from_str::<Value>(&body) {
                Ok(value) => value,
                Err(_) => Value::String(body),
            }
        })
        .collect()
}
