//! `fleet showback` commands

use crate::client::FleetClient;
use anyhow::{anyhow, Result};
use fleet_core::{RecordFilter, ShowbackRange, ShowbackRecord, YearMonth};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ShowbackRow {
    #[tabled(rename = "VMID")]
    vmid: i64,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "OWNER")]
    owner: String,
    #[tabled(rename = "MONTH")]
    month: String,
    #[tabled(rename = "HOURS")]
    hours: String,
    #[tabled(rename = "COST")]
    cost: String,
}

/// Parse optional `MM/YYYY` or `YYYY-MM` bounds.
pub fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<ShowbackRange> {
    let month = |s: &str| {
        YearMonth::parse(s).ok_or_else(|| anyhow!("Invalid month: {} (expected MM/YYYY)", s))
    };
    Ok(ShowbackRange::new(start.map(month).transpose()?, end.map(month).transpose()?))
}

/// Recompute the ledger over the given months.
pub async fn calc(start: Option<&str>, end: Option<&str>) -> Result<()> {
    let range = parse_range(start, end)?;
    let client = FleetClient::connect().await?;

    let rows = client.pool.calculate_showback(range).await?;
    println!("{} showback record(s) written", rows);

    client.close().await;
    Ok(())
}

pub async fn list(
    filter: RecordFilter,
    start: Option<&str>,
    end: Option<&str>,
    json: bool,
) -> Result<()> {
    let range = parse_range(start, end)?;
    let client = FleetClient::connect().await?;
    let doc = client.pool.dump_showback(filter, range).await?;
    client.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let records: Vec<ShowbackRecord> = serde_json::from_value(doc["SHOWBACK_RECORDS"].clone())?;
    if records.is_empty() {
        println!("No showback records");
        return Ok(());
    }

    let total: f64 = records.iter().map(|r| r.cost).sum();
    let rows: Vec<ShowbackRow> = records
        .into_iter()
        .map(|r| ShowbackRow {
            vmid: r.vmid,
            owner: if r.uname.is_empty() { "-".to_string() } else { r.uname },
            month: YearMonth::new(r.year, r.month).to_string(),
            hours: format!("{:.2}", r.hours),
            cost: format!("{:.2}", r.cost),
            name: if r.vmname.is_empty() { "-".to_string() } else { r.vmname },
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    println!("Total cost: {:.2}", total);

    Ok(())
}
