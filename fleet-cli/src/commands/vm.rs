//! `fleet vm` commands

use crate::client::FleetClient;
use anyhow::{bail, Context, Result};
use fleet_core::{LcmState, NewVm, VmState, VmTemplate};
use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};

/// Capacity, pricing and ownership of a new VM.
pub struct CreateArgs {
    pub name: String,
    pub cpu: f64,
    pub memory: i64,
    pub cpu_cost: f64,
    pub memory_cost: f64,
    pub uid: i64,
    pub uname: String,
    pub gid: i64,
    pub gname: String,
    pub attributes: Vec<String>,
    pub hold: bool,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "OWNER")]
    owner: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "LCM")]
    lcm_state: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "CPU")]
    cpu: f64,
    #[tabled(rename = "MEMORY")]
    memory: String,
}

/// Parse `KEY=VALUE` template attributes. Keys are upper-cased.
pub fn parse_attributes(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_uppercase(), value.to_string()))
            }
            _ => bail!("Invalid attribute format: {} (expected KEY=VALUE)", pair),
        })
        .collect()
}

pub async fn create(args: CreateArgs) -> Result<()> {
    let client = FleetClient::connect().await?;

    let vm = NewVm {
        name: args.name,
        uid: args.uid,
        uname: args.uname,
        gid: args.gid,
        gname: args.gname,
        template: VmTemplate {
            cpu: args.cpu,
            memory: args.memory,
            cpu_cost: args.cpu_cost,
            memory_cost: args.memory_cost,
            attributes: parse_attributes(&args.attributes)?,
        },
    };

    let oid = client.pool.allocate(&vm, args.hold).await.context("Failed to allocate VM")?;
    println!("ID: {}", oid);

    client.close().await;
    Ok(())
}

pub async fn list() -> Result<()> {
    let client = FleetClient::connect().await?;
    let vms = client.pool.state().list_vms().await?;
    client.close().await;

    if vms.is_empty() {
        println!("No VMs");
        return Ok(());
    }

    let rows: Vec<VmRow> = vms
        .into_iter()
        .map(|vm| VmRow {
            id: vm.oid,
            owner: format!("{}/{}", vm.uname, vm.gname),
            state: vm.state.to_string(),
            lcm_state: vm.lcm_state.to_string(),
            host: vm.hostname.unwrap_or_else(|| "-".to_string()),
            cpu: vm.template.cpu,
            memory: format!("{}M", vm.template.memory),
            name: vm.name,
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    Ok(())
}

pub async fn set_state(id: i64, state: &str, lcm_state: Option<&str>) -> Result<()> {
    let state: VmState = state.parse()?;
    let lcm_state: LcmState = match lcm_state {
        Some(lcm) => lcm.parse()?,
        None => LcmState::LcmInit,
    };

    let client = FleetClient::connect().await?;
    client.pool.update_state(id, state, lcm_state).await?;
    println!("VM {} is now {}/{}", id, state, lcm_state);

    client.close().await;
    Ok(())
}

pub async fn deploy(id: i64, host: &str, stime: Option<i64>) -> Result<()> {
    let client = FleetClient::connect().await?;
    let stime = stime.unwrap_or_else(|| chrono::Utc::now().timestamp());

    let record = client.pool.deploy(id, host, stime).await?;
    println!("VM {} deployed on {} (history #{})", id, host, record.seq);

    client.close().await;
    Ok(())
}

pub async fn undeploy(id: i64, etime: Option<i64>) -> Result<()> {
    let client = FleetClient::connect().await?;
    let etime = etime.unwrap_or_else(|| chrono::Utc::now().timestamp());

    let record = client.pool.close_history(id, etime).await?;
    println!("VM {} left {} (history #{})", id, record.hostname, record.seq);

    client.close().await;
    Ok(())
}

pub async fn rm(id: i64) -> Result<()> {
    let client = FleetClient::connect().await?;
    client.pool.purge(id).await?;
    println!("VM deleted: {}", id);

    client.close().await;
    Ok(())
}
