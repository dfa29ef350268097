use super::*;
use crate::types::{NewVm, VmState, VmTemplate};
use chrono::{FixedOffset, Utc};
use chrono_tz::America::Asuncion;
use chrono_tz::Europe::Berlin;
use serde_json::json;

fn ts(y: i32, m: u32, d: u32, h: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn interval(oid: i64, seq: i64, stime: i64, etime: i64, cpu: f64, cpu_cost: f64) -> HistoryRecord {
    HistoryRecord {
        oid,
        seq,
        hostname: "node1".to_string(),
        stime,
        etime,
        cpu,
        memory: 0,
        cpu_cost,
        memory_cost: 0.0,
    }
}

async fn engine() -> ShowbackEngine<Utc> {
    let state = StateManager::new_in_memory().await.unwrap();
    ShowbackEngine::with_timezone(state, DEFAULT_BATCH_SIZE, Utc)
}

async fn rows<Tz: TimeZone>(engine: &ShowbackEngine<Tz>) -> Vec<ShowbackRecord> {
    let doc = engine
        .state
        .dump_showback(RecordFilter::default(), ShowbackRange::default())
        .await
        .unwrap();
    serde_json::from_value(doc["SHOWBACK_RECORDS"].clone()).unwrap()
}

#[test]
fn test_accumulate_single_month() {
    let slots = [ts(2024, 1, 1, 0), ts(2024, 2, 1, 0)];
    let record = interval(7, 0, ts(2024, 1, 10, 0), ts(2024, 1, 20, 0), 2.0, 0.1);

    let totals = accumulate(&[serde_json::to_value(record).unwrap()], &slots);

    let usage = totals[&(7, slots[0])];
    assert!(close(usage.hours, 240.0));
    assert!(close(usage.cost, 48.0));
}

#[test]
fn test_accumulate_adds_intervals_and_memory_cost() {
    let slots = [ts(2024, 1, 1, 0), ts(2024, 2, 1, 0)];
    let mut first = interval(3, 0, ts(2024, 1, 1, 0), ts(2024, 1, 1, 10), 1.0, 1.0);
    first.memory = 512;
    first.memory_cost = 0.01;
    let second = interval(3, 1, ts(2024, 1, 2, 0), ts(2024, 1, 2, 5), 1.0, 1.0);

    let values = [serde_json::to_value(first).unwrap(), serde_json::to_value(second).unwrap()];
    let totals = accumulate(&values, &slots);

    assert_eq!(totals.len(), 1);
    let usage = totals[&(3, slots[0])];
    assert!(close(usage.hours, 15.0));
    // 10h * (1.0 + 5.12) + 5h * 1.0
    assert!(close(usage.cost, 66.2));
}

#[test]
fn test_accumulate_skips_malformed_and_unstarted() {
    let slots = [ts(2024, 1, 1, 0), ts(2024, 2, 1, 0)];
    let values = [
        json!("not a document"),
        json!({ "SEQ": 0, "STIME": ts(2024, 1, 2, 0) }),
        json!({ "OID": 1, "STIME": "yesterday" }),
        json!({ "OID": 2, "STIME": 0, "ETIME": 0, "CPU": 1.0 }),
        serde_json::to_value(interval(4, 0, ts(2024, 1, 2, 0), ts(2024, 1, 2, 1), 1.0, 1.0))
            .unwrap(),
    ];

    let totals = accumulate(&values, &slots);
    assert_eq!(totals.keys().map(|(vm, _)| *vm).collect::<Vec<_>>(), vec![4]);
}

#[tokio::test]
async fn test_month_slots_end_with_window_end() {
    let engine = engine().await;

    let end = ts(2024, 3, 15, 12);
    let slots = engine.month_slots(ts(2024, 1, 20, 0), end).unwrap();
    assert_eq!(slots, vec![ts(2024, 1, 1, 0), ts(2024, 2, 1, 0), ts(2024, 3, 1, 0), end]);

    // End exactly on a month boundary adds no empty slot
    let slots = engine.month_slots(ts(2024, 1, 20, 0), ts(2024, 2, 1, 0)).unwrap();
    assert_eq!(slots, vec![ts(2024, 1, 1, 0), ts(2024, 2, 1, 0)]);
}

#[tokio::test]
async fn test_month_start_rolls_over_and_honours_offset() {
    let engine = engine().await;
    assert_eq!(engine.month_start(2023, 13).unwrap(), ts(2024, 1, 1, 0));
    assert!(matches!(engine.month_start(2024, 0), Err(FleetError::InvalidWindow { .. })));

    let state = StateManager::new_in_memory().await.unwrap();
    let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
    let engine = ShowbackEngine::with_timezone(state, 10, tokyo);
    assert_eq!(engine.month_start(2024, 2).unwrap(), ts(2024, 1, 31, 15));
}

#[tokio::test]
async fn test_resolve_window() {
    let engine = engine().await;
    let now = ts(2024, 6, 15, 0);

    let window = engine.resolve_window(ShowbackRange::month(2024, 1), None, now).unwrap();
    assert_eq!(window, Some((ts(2024, 1, 1, 0), ts(2024, 2, 1, 0))));

    // End clamped to now
    let window = engine.resolve_window(ShowbackRange::month(2024, 6), None, now).unwrap();
    assert_eq!(window, Some((ts(2024, 6, 1, 0), now)));

    // December end rolls into the next year
    let window = engine.resolve_window(ShowbackRange::month(2023, 12), None, now).unwrap();
    assert_eq!(window, Some((ts(2023, 12, 1, 0), ts(2024, 1, 1, 0))));

    // Missing start uses the earliest history record
    let range = ShowbackRange::new(None, None);
    let earliest = ts(2024, 2, 10, 6);
    assert_eq!(engine.resolve_window(range, Some(earliest), now).unwrap(), Some((earliest, now)));
    assert_eq!(engine.resolve_window(range, None, now).unwrap(), None);

    // Start after end
    let range = ShowbackRange::new(Some(YearMonth::new(2024, 5)), Some(YearMonth::new(2024, 3)));
    assert_eq!(engine.resolve_window(range, None, now).unwrap(), None);
}

#[tokio::test]
async fn test_resolve_window_rejects_bad_months() {
    let engine = engine().await;
    let now = ts(2024, 6, 15, 0);

    for range in [
        ShowbackRange::new(Some(YearMonth::new(2023, 13)), None),
        ShowbackRange::new(None, Some(YearMonth::new(2024, 0))),
        ShowbackRange::new(Some(YearMonth::new(2024, 1)), Some(YearMonth::new(2024, 13))),
    ] {
        let result = engine.resolve_window(range, Some(ts(2024, 1, 1, 0)), now);
        assert!(matches!(result, Err(FleetError::InvalidWindow { .. })), "{:?}", range);
    }

    let result = engine.calculate_at(ShowbackRange::month(2024, 13), now).await;
    assert!(matches!(result, Err(FleetError::InvalidWindow { .. })));
}

#[tokio::test]
async fn test_dst_shortens_only_the_boundary_month() {
    let state = StateManager::new_in_memory().await.unwrap();
    let engine = ShowbackEngine::with_timezone(state, DEFAULT_BATCH_SIZE, Berlin);

    let starts: Vec<i64> = (2..=5).map(|month| engine.month_start(2024, month).unwrap()).collect();
    let hours: Vec<i64> = starts.windows(2).map(|w| (w[1] - w[0]) / 3600).collect();
    // February (leap year), March loses the hour, April
    assert_eq!(hours, vec![29 * 24, 743, 30 * 24]);
    assert_eq!(starts[1], ts(2024, 2, 29, 23));
    assert_eq!(starts[2], ts(2024, 3, 31, 22));

    engine
        .state
        .insert_history(&interval(5, 0, ts(2024, 2, 20, 0), ts(2024, 4, 10, 0), 1.0, 1.0))
        .await
        .unwrap();
    let written =
        engine.calculate_at(ShowbackRange::month(2024, 3), ts(2024, 6, 1, 0)).await.unwrap();
    assert_eq!(written, 1);

    let rows = rows(&engine).await;
    assert_eq!((rows[0].year, rows[0].month), (2024, 3));
    assert!(close(rows[0].hours, 743.0));
}

#[tokio::test]
async fn test_month_starting_in_a_dst_gap() {
    let state = StateManager::new_in_memory().await.unwrap();
    let engine = ShowbackEngine::with_timezone(state, DEFAULT_BATCH_SIZE, Asuncion);

    // Clocks jumped from 00:00 to 01:00 on 2017-10-01; the month starts at 01:00 -03
    let october = engine.month_start(2017, 10).unwrap();
    assert_eq!(october, ts(2017, 10, 1, 4));
    assert_eq!(engine.year_month(october).unwrap(), YearMonth::new(2017, 10));
    assert_eq!(engine.year_month(october - 1).unwrap(), YearMonth::new(2017, 9));

    let september = engine.month_start(2017, 9).unwrap();
    assert_eq!((october - september) / 3600, 30 * 24);
}

#[tokio::test]
async fn test_single_month_example() {
    let engine = engine().await;
    engine
        .state
        .insert_history(&interval(7, 0, ts(2024, 1, 10, 0), ts(2024, 1, 20, 0), 2.0, 0.1))
        .await
        .unwrap();

    let written =
        engine.calculate_at(ShowbackRange::month(2024, 1), ts(2024, 6, 1, 0)).await.unwrap();
    assert_eq!(written, 1);

    let rows = rows(&engine).await;
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].vmid, rows[0].year, rows[0].month), (7, 2024, 1));
    assert!(close(rows[0].hours, 240.0));
    assert!(close(rows[0].cost, 48.0));
    // No VM record left: identity is empty
    assert_eq!(rows[0].vmname, "");
    assert_eq!(rows[0].uid, 0);
}

#[tokio::test]
async fn test_interval_split_conserves_hours() {
    let engine = engine().await;
    let stime = ts(2024, 1, 31, 12);
    let etime = ts(2024, 2, 1, 12);
    engine.state.insert_history(&interval(1, 0, stime, etime, 1.0, 1.0)).await.unwrap();

    let range = ShowbackRange::new(Some(YearMonth::new(2024, 1)), Some(YearMonth::new(2024, 2)));
    assert_eq!(engine.calculate_at(range, ts(2024, 6, 1, 0)).await.unwrap(), 2);

    let rows = rows(&engine).await;
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].month, rows[1].month), (1, 2));
    assert!(close(rows[0].hours, 12.0));
    assert!(close(rows[1].hours, 12.0));
    assert!(close(rows[0].hours + rows[1].hours, (etime - stime) as f64 / 3600.0));
}

#[tokio::test]
async fn test_open_interval_bounded_by_now() {
    let engine = engine().await;
    engine.state.insert_history(&interval(2, 0, ts(2024, 3, 10, 0), 0, 1.0, 0.5)).await.unwrap();

    let now = ts(2024, 4, 2, 0);
    let written = engine.calculate_at(ShowbackRange::default(), now).await.unwrap();
    assert_eq!(written, 2);

    let rows = rows(&engine).await;
    // March 10 to April 1, then April 1 to now
    assert!(close(rows[0].hours, 22.0 * 24.0));
    assert!(close(rows[1].hours, 24.0));
    assert!(close(rows[1].cost, 12.0));
    assert_eq!(rows[1].month, 4);
}

#[tokio::test]
async fn test_recomputation_is_idempotent() {
    let engine = engine().await;
    let state = &engine.state;
    let oid = state
        .insert_vm(
            &NewVm {
                name: "db".to_string(),
                uid: 4,
                uname: "bob".to_string(),
                gid: 2,
                gname: "dev".to_string(),
                template: VmTemplate::default(),
            },
            VmState::Pending,
            ts(2024, 1, 1, 0),
        )
        .await
        .unwrap();

    let first = interval(oid, 0, ts(2024, 1, 5, 3), ts(2024, 2, 7, 9), 1.5, 0.013);
    let second = interval(oid, 1, ts(2024, 2, 7, 9), 0, 3.0, 0.021);
    state.insert_history(&first).await.unwrap();
    state.insert_history(&second).await.unwrap();

    let now = ts(2024, 3, 3, 17);
    engine.calculate_at(ShowbackRange::default(), now).await.unwrap();
    let first = rows(&engine).await;
    engine.calculate_at(ShowbackRange::default(), now).await.unwrap();
    let second = rows(&engine).await;

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(first[0].vmname, "db");
    assert_eq!(first[0].uname, "bob");
    assert_eq!(first[0].gid, 2);
}

#[tokio::test]
async fn test_small_batches_write_everything() {
    let state = StateManager::new_in_memory().await.unwrap();
    for oid in 1..=5 {
        let record = interval(oid, 0, ts(2024, 1, 2, 0), ts(2024, 1, 3, 0), 1.0, 1.0);
        state.insert_history(&record).await.unwrap();
    }
    let engine = ShowbackEngine::with_timezone(state, 2, Utc);

    let written =
        engine.calculate_at(ShowbackRange::month(2024, 1), ts(2024, 6, 1, 0)).await.unwrap();
    assert_eq!(written, 5);
    assert_eq!(rows(&engine).await.len(), 5);
}

#[tokio::test]
async fn test_no_history_writes_nothing() {
    let engine = engine().await;
    assert_eq!(engine.calculate_at(ShowbackRange::default(), ts(2024, 6, 1, 0)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_stored_record_is_skipped() {
    let engine = engine().await;
    engine
        .state
        .insert_history(&interval(1, 0, ts(2024, 1, 2, 0), ts(2024, 1, 3, 0), 1.0, 1.0))
        .await
        .unwrap();
    sqlx::query("INSERT INTO history (vid, seq, stime, etime, body) VALUES (9, 0, ?, 0, 'garbage')")
        .bind(ts(2024, 1, 2, 0))
        .execute(engine.state.pool())
        .await
        .unwrap();

    let written =
        engine.calculate_at(ShowbackRange::month(2024, 1), ts(2024, 6, 1, 0)).await.unwrap();
    assert_eq!(written, 1);
}

#[tokio::test]
async fn test_write_failure_aborts_run() {
    let engine = engine().await;
    engine
        .state
        .insert_history(&interval(1, 0, ts(2024, 1, 2, 0), ts(2024, 1, 3, 0), 1.0, 1.0))
        .await
        .unwrap();
    sqlx::query("DROP TABLE vm_showback").execute(engine.state.pool()).await.unwrap();

    let result = engine.calculate_at(ShowbackRange::month(2024, 1), ts(2024, 6, 1, 0)).await;
    assert!(matches!(result, Err(FleetError::DatabaseError(_))));
}
