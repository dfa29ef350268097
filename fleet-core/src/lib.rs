//! Fleet Core Library
//!
//! VM pool with edge-triggered state hooks and a monthly showback ledger,
//! shared by the `fleetd` daemon and the `fleet` CLI.

pub mod config;
pub mod error;
pub mod hooks;
pub mod observability;
pub mod paths;
pub mod pool;
pub mod showback;
pub mod state;
pub mod types;

// Re-export commonly used items
pub use config::Config;
pub use error::{FleetError, Result};
pub use hooks::{
    Hook, HookDispatcher, HookExecutor, HookRegistry, HookSpec, HookTrigger, ProcessExecutor,
    TransitionDetector,
};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use pool::VmPool;
pub use showback::ShowbackEngine;
pub use state::StateManager;
pub use types::{
    HistoryRecord, LcmState, NewVm, RecordFilter, ShowbackRange, ShowbackRecord, TransitionKey,
    Vm, VmState, VmTemplate, YearMonth,
};
