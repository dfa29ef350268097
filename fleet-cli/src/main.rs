use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fleet_core::RecordFilter;

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet VM accounting and hooks CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage VMs
    #[command(subcommand)]
    Vm(VmCommands),

    /// Monthly cost ledger
    #[command(subcommand)]
    Showback(ShowbackCommands),

    /// Dump execution history
    Acct {
        #[command(flatten)]
        filter: FilterArgs,

        /// Start time (unix seconds or YYYY-MM-DD)
        #[arg(short, long)]
        start: Option<String>,

        /// End time (unix seconds or YYYY-MM-DD)
        #[arg(short, long)]
        end: Option<String>,

        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },

    /// List configured hooks
    Hooks,
}

#[derive(Subcommand)]
enum VmCommands {
    /// Allocate a VM
    Create {
        /// VM name
        name: String,

        /// Number of CPUs
        #[arg(long, default_value = "1")]
        cpu: f64,

        /// Memory in MB
        #[arg(short, long, default_value = "512")]
        memory: i64,

        /// Cost per CPU hour
        #[arg(long, default_value = "0")]
        cpu_cost: f64,

        /// Cost per MB hour
        #[arg(long, default_value = "0")]
        memory_cost: f64,

        #[arg(long, default_value = "0")]
        uid: i64,

        #[arg(long, default_value = "oneadmin")]
        uname: String,

        #[arg(long, default_value = "0")]
        gid: i64,

        #[arg(long, default_value = "oneadmin")]
        gname: String,

        /// Template attributes (KEY=VALUE)
        #[arg(short, long = "attr")]
        attributes: Vec<String>,

        /// Create the VM on hold
        #[arg(long)]
        hold: bool,
    },

    /// List VMs
    List,

    /// Set the state of a VM
    State {
        id: i64,

        /// VM state (e.g. ACTIVE, STOPPED)
        state: String,

        /// LCM state (e.g. RUNNING), LCM_INIT if omitted
        lcm_state: Option<String>,
    },

    /// Open an execution interval on a host
    Deploy {
        id: i64,

        host: String,

        /// Start time in unix seconds, now if omitted
        #[arg(long)]
        stime: Option<i64>,
    },

    /// Close the open execution interval
    Undeploy {
        id: i64,

        /// End time in unix seconds, now if omitted
        #[arg(long)]
        etime: Option<i64>,
    },

    /// Delete a VM
    Rm { id: i64 },
}

#[derive(Subcommand)]
enum ShowbackCommands {
    /// Recompute the ledger
    Calc {
        /// First month (MM/YYYY)
        #[arg(short, long)]
        start: Option<String>,

        /// Last month (MM/YYYY)
        #[arg(short, long)]
        end: Option<String>,
    },

    /// Show ledger rows
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// First month (MM/YYYY)
        #[arg(short, long)]
        start: Option<String>,

        /// Last month (MM/YYYY)
        #[arg(short, long)]
        end: Option<String>,

        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Only this VM
    #[arg(long)]
    vm: Option<i64>,

    /// Only VMs owned by this user id
    #[arg(long)]
    user: Option<i64>,
}

impl From<FilterArgs> for RecordFilter {
    fn from(args: FilterArgs) -> Self {
        RecordFilter { vm_id: args.vm, uid: args.user }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Vm(vm_cmd) => match vm_cmd {
            VmCommands::Create {
                name,
                cpu,
                memory,
                cpu_cost,
                memory_cost,
                uid,
                uname,
                gid,
                gname,
                attributes,
                hold,
            } => {
                commands::vm::create(commands::vm::CreateArgs {
                    name,
                    cpu,
                    memory,
                    cpu_cost,
                    memory_cost,
                    uid,
                    uname,
                    gid,
                    gname,
                    attributes,
                    hold,
                })
                .await?;
            }
            VmCommands::List => {
                commands::vm::list().await?;
            }
            VmCommands::State { id, state, lcm_state } => {
                commands::vm::set_state(id, &state, lcm_state.as_deref()).await?;
            }
            VmCommands::Deploy { id, host, stime } => {
                commands::vm::deploy(id, &host, stime).await?;
            }
            VmCommands::Undeploy { id, etime } => {
                commands::vm::undeploy(id, etime).await?;
            }
            VmCommands::Rm { id } => {
                commands::vm::rm(id).await?;
            }
        },

        Commands::Showback(showback_cmd) => match showback_cmd {
            ShowbackCommands::Calc { start, end } => {
                commands::showback::calc(start.as_deref(), end.as_deref()).await?;
            }
            ShowbackCommands::List { filter, start, end, json } => {
                commands::showback::list(filter.into(), start.as_deref(), end.as_deref(), json)
                    .await?;
            }
        },

        Commands::Acct { filter, start, end, json } => {
            commands::acct(filter.into(), start.as_deref(), end.as_deref(), json).await?;
        }

        Commands::Hooks => {
            commands::hooks()?;
        }
    }

    Ok(())
}
