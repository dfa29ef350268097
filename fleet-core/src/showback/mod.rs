//! Showback: per-VM, per-month cost and usage ledger.
//!
//! The engine replays the execution history of every VM over a window of
//! calendar months and upserts one [`ShowbackRecord`] per VM and month.
//!
//! 1. Resolve `[window_start, window_end)` from the requested months, the
//!    earliest history record and the current time.
//! 2. Cut the window into month slots in the engine's time zone.
//! 3. Load the intersecting history intervals and accumulate the hours and
//!    cost each contributes to each slot.
//! 4. Attach the VM identity and write the rows in batches.
//!
//! Results are recomputed from scratch on every run, so running the same
//! window twice over unchanged history writes identical rows.

use crate::error::{FleetError, Result};
use crate::state::StateManager;
use crate::types::{HistoryRecord, RecordFilter, ShowbackRange, ShowbackRecord, YearMonth};
use chrono::{Datelike, Duration, Local, NaiveDate, TimeZone};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
mod tests;

/// Rows written per statement unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Accumulated usage of one VM in one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub cost: f64,
    pub hours: f64,
}

/// Computes the showback ledger from the history log.
pub struct ShowbackEngine<Tz: TimeZone = Local> {
    state: StateManager,
    batch_size: usize,
    tz: Tz,
}

impl ShowbackEngine<Local> {
    /// Engine cutting months in the local time zone.
    pub fn new(state: StateManager, batch_size: usize) -> Self {
        Self::with_timezone(state, batch_size, Local)
    }
}

impl<Tz> ShowbackEngine<Tz>
where
    Tz: TimeZone + Send + Sync,
    Tz::Offset: Send + Sync,
{
    pub fn with_timezone(state: StateManager, batch_size: usize, tz: Tz) -> Self {
        Self { state, batch_size: batch_size.max(1), tz }
    }

    /// Compute and store the ledger for `range`, up to now.
    ///
    /// Returns the number of rows written.
    pub async fn calculate(&self, range: ShowbackRange) -> Result<usize> {
        self.calculate_at(range, chrono::Utc::now().timestamp()).await
    }

    /// Same as [`calculate`](Self::calculate) with an explicit "now".
    #[instrument(skip(self), fields(start = ?range.start, end = ?range.end))]
    pub async fn calculate_at(&self, range: ShowbackRange, now: i64) -> Result<usize> {
        let started = Instant::now();
        metrics::counter!("fleet_showback_runs_total").increment(1);

        let earliest = match range.start {
            Some(_) => None,
            None => self.state.min_history_stime().await?,
        };

        let Some((window_start, window_end)) = self.resolve_window(range, earliest, now)? else {
            info!("No history to account, showback skipped");
            return Ok(0);
        };

        let slots = self.month_slots(window_start, window_end)?;
        debug!(window_start, window_end, slots = slots.len() - 1, "Showback window resolved");

        let doc = self
            .state
            .dump_history(RecordFilter::default(), Some(slots[0]), Some(window_end))
            .await?;
        let records = doc["HISTORY_RECORDS"].as_array().map(Vec::as_slice).unwrap_or_default();

        let totals = accumulate(records, &slots);
        let written = self.write(totals).await?;

        metrics::counter!("fleet_showback_rows_total").increment(written as u64);
        metrics::histogram!("fleet_showback_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(rows = written, records = records.len(), "Showback computed");

        Ok(written)
    }

    /// Resolve the window `[start, end)` in unix seconds.
    ///
    /// `earliest` is the earliest history start, used when `range` has no
    /// start. Returns `None` when there is nothing to account. Months outside
    /// `1..=12` are rejected.
    pub fn resolve_window(
        &self,
        range: ShowbackRange,
        earliest: Option<i64>,
        now: i64,
    ) -> Result<Option<(i64, i64)>> {
        for ym in [range.start, range.end].into_iter().flatten() {
            if !(1..=12).contains(&ym.month) {
                return Err(FleetError::InvalidWindow {
                    reason: format!("month {} of {} is out of range", ym.month, ym.year),
                });
            }
        }

        let start = match range.start {
            Some(ym) => self.month_start(ym.year, ym.month)?,
            None => match earliest {
                Some(stime) => stime,
                None => return Ok(None),
            },
        };

        let end = match range.end {
            Some(ym) => self.month_start(ym.year, ym.month + 1)?.min(now),
            None => now,
        };

        if start >= end {
            debug!(start, end, "Empty showback window");
            return Ok(None);
        }

        Ok(Some((start, end)))
    }

    /// First instant of a month. Months past December roll into the
    /// following year.
    pub fn month_start(&self, year: i32, month: u32) -> Result<i64> {
        if month == 0 {
            return Err(FleetError::InvalidWindow { reason: "month 0".to_string() });
        }
        let year = year + ((month - 1) / 12) as i32;
        let month = (month - 1) % 12 + 1;

        let midnight = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| FleetError::InvalidWindow {
                reason: format!("{} is out of range", YearMonth::new(year, month)),
            })?;

        // A DST gap can swallow midnight: take the first valid hour after it
        (0..=3)
            .find_map(|hour| {
                self.tz.from_local_datetime(&(midnight + Duration::hours(hour))).earliest()
            })
            .map(|dt| dt.timestamp())
            .ok_or_else(|| FleetError::InvalidWindow {
                reason: format!("no valid local time at start of {}", YearMonth::new(year, month)),
            })
    }

    /// Month boundaries covering `[start, end)`, followed by `end` itself.
    ///
    /// The first boundary is the start of the month containing `start`.
    pub fn month_slots(&self, start: i64, end: i64) -> Result<Vec<i64>> {
        let first = self.year_month(start)?;
        let (mut year, mut month) = (first.year, first.month);

        let mut slots = Vec::new();
        loop {
            let t = self.month_start(year, month)?;
            if t >= end {
                break;
            }
            slots.push(t);

            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        slots.push(end);

        Ok(slots)
    }

    /// Calendar month containing a timestamp.
    pub fn year_month(&self, timestamp: i64) -> Result<YearMonth> {
        let dt = self.tz.timestamp_opt(timestamp, 0).earliest().ok_or_else(|| {
            FleetError::InvalidWindow { reason: format!("timestamp {} out of range", timestamp) }
        })?;
        Ok(YearMonth::new(dt.year(), dt.month()))
    }

    /// Attach identities and upsert the rows in batches.
    async fn write(&self, totals: BTreeMap<(i64, i64), Usage>) -> Result<usize> {
        let mut batch = Vec::with_capacity(self.batch_size.min(totals.len()));
        let mut current_vm = None;
        let mut who = Identity::default();
        let mut written = 0;

        for ((vm_id, slot), usage) in totals {
            // Keys are ordered by VM, so each identity is fetched once
            if current_vm != Some(vm_id) {
                who = self.identity(vm_id).await;
                current_vm = Some(vm_id);
            }

            let ym = self.year_month(slot)?;
            batch.push(ShowbackRecord {
                vmid: vm_id,
                vmname: who.name.clone(),
                uid: who.uid,
                gid: who.gid,
                uname: who.uname.clone(),
                gname: who.gname.clone(),
                year: ym.year,
                month: ym.month,
                cost: usage.cost,
                hours: usage.hours,
            });

            if batch.len() >= self.batch_size {
                written += self.flush(&mut batch).await?;
            }
        }

        written += self.flush(&mut batch).await?;
        Ok(written)
    }

    async fn flush(&self, batch: &mut Vec<ShowbackRecord>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.state.upsert_showback(batch).await {
            metrics::counter!("fleet_showback_failures_total").increment(1);
            warn!("Showback write failed, run aborted: {}", e);
            return Err(e);
        }

        let count = batch.len();
        batch.clear();
        Ok(count)
    }

    /// Current identity of a VM, empty when the record is gone.
    async fn identity(&self, vm_id: i64) -> Identity {
        match self.state.get_vm_locked(vm_id).await {
            Ok(Some(vm)) => Identity {
                name: vm.name.clone(),
                uid: vm.uid,
                gid: vm.gid,
                uname: vm.uname.clone(),
                gname: vm.gname.clone(),
            },
            Ok(None) => Identity::default(),
            Err(e) => {
                warn!(vm_id, "Failed to read VM identity: {}", e);
                Identity::default()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Identity {
    name: String,
    uid: i64,
    gid: i64,
    uname: String,
    gname: String,
}

/// Accumulate the usage of every history document over the slot boundaries.
///
/// `slots` holds the slot starts followed by the window end. Keys are
/// `(vm_id, slot_start)`. Documents that do not decode as a history record
/// are skipped.
pub fn accumulate(records: &[Value], slots: &[i64]) -> BTreeMap<(i64, i64), Usage> {
    let mut totals: BTreeMap<(i64, i64), Usage> = BTreeMap::new();

    for value in records {
        let record: HistoryRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed history record: {}", e);
                continue;
            }
        };

        if record.stime == 0 {
            continue;
        }

        for window in slots.windows(2) {
            let (t, t_next) = (window[0], window[1]);

            if !(record.is_open() || record.etime > t) || record.stime > t_next {
                continue;
            }

            let from = record.stime.max(t);
            let to = if record.is_open() { t_next } else { record.etime.min(t_next) };
            if to <= from {
                continue;
            }

            let hours = (to - from) as f64 / 3600.0;
            let usage = totals.entry((record.oid, t)).or_default();
            usage.hours += hours;
            usage.cost += record.cpu_cost * record.cpu * hours
                + record.memory_cost * record.memory as f64 * hours;
        }
    }

    totals
}
