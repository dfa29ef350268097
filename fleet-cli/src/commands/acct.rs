//! `fleet acct` command

use crate::client::FleetClient;
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, TimeZone};
use fleet_core::{HistoryRecord, RecordFilter};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct AcctRow {
    #[tabled(rename = "VMID")]
    vmid: i64,
    #[tabled(rename = "SEQ")]
    seq: i64,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "START")]
    start: String,
    #[tabled(rename = "END")]
    end: String,
    #[tabled(rename = "CPU")]
    cpu: f64,
    #[tabled(rename = "MEMORY")]
    memory: String,
}

/// Unix seconds, or a `YYYY-MM-DD` date at local midnight.
pub fn parse_time(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow!("Invalid time: {} (expected unix seconds or YYYY-MM-DD)", s))?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| anyhow!("Invalid date: {}", s))?;

    chrono::Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| anyhow!("No local midnight on {}", s))
}

fn format_time(secs: i64) -> String {
    if secs == 0 {
        return "-".to_string();
    }
    chrono::Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub async fn acct(
    filter: RecordFilter,
    start: Option<&str>,
    end: Option<&str>,
    json: bool,
) -> Result<()> {
    let start = start.map(parse_time).transpose()?;
    let end = end.map(parse_time).transpose()?;

    let client = FleetClient::connect().await?;
    let doc = client.pool.dump_acct(filter, start, end).await?;
    client.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let records: Vec<HistoryRecord> = doc["HISTORY_RECORDS"]
        .as_array()
        .map(|values| {
            values.iter().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect()
        })
        .unwrap_or_default();

    if records.is_empty() {
        println!("No accounting records");
        return Ok(());
    }

    let rows: Vec<AcctRow> = records
        .into_iter()
        .map(|r| AcctRow {
            vmid: r.oid,
            seq: r.seq,
            start: format_time(r.stime),
            end: format_time(r.etime),
            cpu: r.cpu,
            memory: format!("{}M", r.memory),
            host: r.hostname,
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    Ok(())
}
