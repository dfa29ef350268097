//! VM domain types.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Virtual machine record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Pool-assigned object id
    pub oid: i64,

    /// Human-readable name
    pub name: String,

    /// Owner user id and name
    pub uid: i64,
    pub uname: String,

    /// Owner group id and name
    pub gid: i64,
    pub gname: String,

    /// Primary lifecycle state
    pub state: VmState,

    /// Sub-state, meaningful while ACTIVE
    pub lcm_state: LcmState,

    /// Capacity, cost and free-form attributes
    pub template: VmTemplate,

    /// Host currently running the VM, if deployed
    pub hostname: Option<String>,

    /// Last monitoring poll (unix seconds)
    pub last_poll: i64,

    /// Submission time (unix seconds)
    pub stime: i64,

    /// Termination time, 0 while alive (unix seconds)
    pub etime: i64,
}

impl Vm {
    /// Current `(state, lcm_state)` pair.
    pub fn transition_key(&self) -> TransitionKey {
        TransitionKey { state: self.state, lcm_state: self.lcm_state }
    }
}

/// Capacity and pricing of a VM, plus user attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VmTemplate {
    /// Physical CPUs allocated
    pub cpu: f64,

    /// Memory in megabytes
    pub memory: i64,

    /// Cost per CPU per hour
    #[serde(default)]
    pub cpu_cost: f64,

    /// Cost per memory megabyte per hour
    #[serde(default)]
    pub memory_cost: f64,

    /// Free-form attributes usable as hook placeholders
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Fields needed to allocate a new VM.
#[derive(Debug, Clone, Default)]
pub struct NewVm {
    pub name: String,
    pub uid: i64,
    pub uname: String,
    pub gid: i64,
    pub gname: String,
    pub template: VmTemplate,
}

/// A `(state, lcm_state)` pair; the unit hooks trigger on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionKey {
    pub state: VmState,
    pub lcm_state: LcmState,
}

impl TransitionKey {
    pub fn new(state: VmState, lcm_state: LcmState) -> Self {
        Self { state, lcm_state }
    }
}

impl fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.lcm_state)
    }
}

/// Primary VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Init = 0,
    Pending = 1,
    Hold = 2,
    Active = 3,
    Stopped = 4,
    Suspended = 5,
    Done = 6,
    Failed = 7,
    Poweroff = 8,
    Undeployed = 9,
}

impl VmState {
    pub const ALL: [VmState; 10] = [
        Self::Init,
        Self::Pending,
        Self::Hold,
        Self::Active,
        Self::Stopped,
        Self::Suspended,
        Self::Done,
        Self::Failed,
        Self::Poweroff,
        Self::Undeployed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Pending => "PENDING",
            Self::Hold => "HOLD",
            Self::Active => "ACTIVE",
            Self::Stopped => "STOPPED",
            Self::Suspended => "SUSPENDED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Poweroff => "POWEROFF",
            Self::Undeployed => "UNDEPLOYED",
        }
    }

    /// Integer code stored in the database.
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| FleetError::InvalidState { value: code.to_string() })
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| FleetError::InvalidState { value: s.to_string() })
    }
}

/// Life-cycle manager sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LcmState {
    LcmInit = 0,
    Prolog = 1,
    Boot = 2,
    Running = 3,
    Migrate = 4,
    SaveStop = 5,
    SaveSuspend = 6,
    SaveMigrate = 7,
    PrologMigrate = 8,
    PrologResume = 9,
    EpilogStop = 10,
    Epilog = 11,
    Shutdown = 12,
    Cancel = 13,
    Failure = 14,
    CleanupResubmit = 15,
    Unknown = 16,
    Hotplug = 17,
    ShutdownPoweroff = 18,
    BootUnknown = 19,
    BootPoweroff = 20,
    BootSuspended = 21,
    BootStopped = 22,
    CleanupDelete = 23,
    HotplugSnapshot = 24,
    HotplugNic = 25,
    HotplugSaveas = 26,
    HotplugSaveasPoweroff = 27,
    HotplugSaveasSuspended = 28,
    ShutdownUndeploy = 29,
    EpilogUndeploy = 30,
    PrologUndeploy = 31,
    BootUndeploy = 32,
}

impl LcmState {
    pub const ALL: [LcmState; 33] = [
        Self::LcmInit,
        Self::Prolog,
        Self::Boot,
        Self::Running,
        Self::Migrate,
        Self::SaveStop,
        Self::SaveSuspend,
        Self::SaveMigrate,
        Self::PrologMigrate,
        Self::PrologResume,
        Self::EpilogStop,
        Self::Epilog,
        Self::Shutdown,
        Self::Cancel,
        Self::Failure,
        Self::CleanupResubmit,
        Self::Unknown,
        Self::Hotplug,
        Self::ShutdownPoweroff,
        Self::BootUnknown,
        Self::BootPoweroff,
        Self::BootSuspended,
        Self::BootStopped,
        Self::CleanupDelete,
        Self::HotplugSnapshot,
        Self::HotplugNic,
        Self::HotplugSaveas,
        Self::HotplugSaveasPoweroff,
        Self::HotplugSaveasSuspended,
        Self::ShutdownUndeploy,
        Self::EpilogUndeploy,
        Self::PrologUndeploy,
        Self::BootUndeploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LcmInit => "LCM_INIT",
            Self::Prolog => "PROLOG",
            Self::Boot => "BOOT",
            Self::Running => "RUNNING",
            Self::Migrate => "MIGRATE",
            Self::SaveStop => "SAVE_STOP",
            Self::SaveSuspend => "SAVE_SUSPEND",
            Self::SaveMigrate => "SAVE_MIGRATE",
            Self::PrologMigrate => "PROLOG_MIGRATE",
            Self::PrologResume => "PROLOG_RESUME",
            Self::EpilogStop => "EPILOG_STOP",
            Self::Epilog => "EPILOG",
            Self::Shutdown => "SHUTDOWN",
            Self::Cancel => "CANCEL",
            Self::Failure => "FAILURE",
            Self::CleanupResubmit => "CLEANUP_RESUBMIT",
            Self::Unknown => "UNKNOWN",
            Self::Hotplug => "HOTPLUG",
            Self::ShutdownPoweroff => "SHUTDOWN_POWEROFF",
            Self::BootUnknown => "BOOT_UNKNOWN",
            Self::BootPoweroff => "BOOT_POWEROFF",
            Self::BootSuspended => "BOOT_SUSPENDED",
            Self::BootStopped => "BOOT_STOPPED",
            Self::CleanupDelete => "CLEANUP_DELETE",
            Self::HotplugSnapshot => "HOTPLUG_SNAPSHOT",
            Self::HotplugNic => "HOTPLUG_NIC",
            Self::HotplugSaveas => "HOTPLUG_SAVEAS",
            Self::HotplugSaveasPoweroff => "HOTPLUG_SAVEAS_POWEROFF",
            Self::HotplugSaveasSuspended => "HOTPLUG_SAVEAS_SUSPENDED",
            Self::ShutdownUndeploy => "SHUTDOWN_UNDEPLOY",
            Self::EpilogUndeploy => "EPILOG_UNDEPLOY",
            Self::PrologUndeploy => "PROLOG_UNDEPLOY",
            Self::BootUndeploy => "BOOT_UNDEPLOY",
        }
    }

    /// Integer code stored in the database.
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| FleetError::InvalidState { value: code.to_string() })
    }
}

impl fmt::Display for LcmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LcmState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| FleetError::InvalidState { value: s.to_string() })
    }
}
