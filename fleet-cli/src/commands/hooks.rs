//! `fleet hooks` command

use anyhow::{Context, Result};
use fleet_core::{Config, HookRegistry, HookSpec};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct HookRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ON")]
    on: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "ARGUMENTS")]
    arguments: String,
    #[tabled(rename = "WHERE")]
    location: &'static str,
}

/// Show the hooks the daemon would register, and why rules were rejected.
pub fn hooks() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let mut registry = HookRegistry::new(&config.hook_dir, &config.remotes_dir);

    let rejected: Vec<String> = config
        .vm_hooks
        .iter()
        .enumerate()
        .filter_map(|(i, value)| {
            HookSpec::from_value(value)
                .and_then(|spec| registry.register(&spec).map(|_| ()))
                .err()
                .map(|e| format!("#{}: {}", i, e))
        })
        .collect();

    if registry.is_empty() {
        println!("No hooks configured");
    } else {
        let rows: Vec<HookRow> = registry
            .hooks()
            .iter()
            .map(|hook| HookRow {
                name: hook.name.clone(),
                on: hook.trigger.to_string(),
                command: hook.command.clone(),
                arguments: hook.arguments.clone(),
                location: if hook.remote { "host" } else { "local" },
            })
            .collect();

        let mut table = Table::new(rows);
        table.with(Style::modern());
        println!("{}", table);
    }

    for reason in &rejected {
        eprintln!("Rejected rule {}", reason);
    }

    Ok(())
}
