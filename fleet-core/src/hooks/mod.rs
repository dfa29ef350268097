//! VM hooks: external commands fired on VM creation and on state transitions.
//!
//! ```text
//!  VmPool ── observe(vm) ──► TransitionDetector ── edge ──► HookRegistry::matching
//!                                                                 │
//!                                                                 ▼
//!                                              HookDispatcher (queue) ──► HookExecutor
//! ```
//!
//! Hooks are parsed once from configuration by the [`HookRegistry`]. The
//! [`TransitionDetector`] turns repeated state observations into edges, and
//! the [`HookDispatcher`] launches the matching hooks without blocking the
//! caller.

use crate::error::{FleetError, Result};
use crate::types::{LcmState, TransitionKey, VmState};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub mod dispatch;
pub mod registry;
pub mod transition;

pub use dispatch::{HookDispatcher, HookExecutor, HookJob, ProcessExecutor};
pub use registry::HookRegistry;
pub use transition::{Transition, TransitionDetector};

/// A hook rule as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HookSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag", skip_serializing_if = "Option::is_none")]
    pub remote: Option<bool>,
    /// Only for `ON = CUSTOM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcm_state: Option<String>,
    /// Only for `ON = CUSTOM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl HookSpec {
    /// Rule with the mandatory fields set.
    pub fn new(on: &str, command: &str) -> Self {
        Self { on: Some(on.to_string()), command: Some(command.to_string()), ..Default::default() }
    }

    /// Decode one `vm_hooks` entry. A malformed entry is an invalid hook,
    /// not a configuration error.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value)
            .map_err(|e| FleetError::InvalidHook { reason: format!("Malformed VM_HOOK: {}", e) })
    }

    /// Whether the rule fires on allocation rather than on a state.
    pub fn is_create(&self) -> bool {
        self.on.as_deref().is_some_and(|on| on.trim().eq_ignore_ascii_case("CREATE"))
    }
}

/// Accepts `true`/`false` as well as `"YES"`/`"NO"`.
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(value)) => Ok(Some(value)),
        Some(Flag::Text(text)) => match text.trim().to_uppercase().as_str() {
            "YES" | "TRUE" => Ok(Some(true)),
            "NO" | "FALSE" | "" => Ok(Some(false)),
            other => Err(de::Error::custom(format!("invalid REMOTE value: {}", other))),
        },
    }
}

/// When a hook fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTrigger {
    /// Once, right after the VM is allocated
    Create,
    /// A lifecycle keyword expanding to a fixed state pair
    Named { keyword: &'static str, key: TransitionKey },
    /// An explicit state pair from the rule
    Custom(TransitionKey),
}

impl HookTrigger {
    /// Resolve a trigger keyword. `CUSTOM` is handled by the registry since
    /// it needs the rule's state fields.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let named = |keyword: &'static str, state: VmState, lcm_state: LcmState| {
            Some(Self::Named { keyword, key: TransitionKey::new(state, lcm_state) })
        };

        match keyword.trim().to_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "PROLOG" => named("PROLOG", VmState::Active, LcmState::Prolog),
            "RUNNING" => named("RUNNING", VmState::Active, LcmState::Running),
            "SHUTDOWN" => named("SHUTDOWN", VmState::Active, LcmState::Epilog),
            "STOP" => named("STOP", VmState::Stopped, LcmState::LcmInit),
            "DONE" => named("DONE", VmState::Done, LcmState::LcmInit),
            "FAILED" => named("FAILED", VmState::Failed, LcmState::LcmInit),
            "UNKNOWN" => named("UNKNOWN", VmState::Active, LcmState::Unknown),
            _ => None,
        }
    }

    /// State pair this trigger fires on, `None` for creation hooks.
    pub fn key(&self) -> Option<TransitionKey> {
        match self {
            Self::Create => None,
            Self::Named { key, .. } | Self::Custom(key) => Some(*key),
        }
    }
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("CREATE"),
            Self::Named { keyword, .. } => f.write_str(keyword),
            Self::Custom(key) => write!(f, "CUSTOM({})", key),
        }
    }
}

/// A registered hook. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub trigger: HookTrigger,
    /// Absolute path of the command
    pub command: String,
    /// Argument template with `$PLACEHOLDER`s
    pub arguments: String,
    /// Run on the VM's host instead of the front-end
    pub remote: bool,
}

impl Hook {
    pub fn is_create(&self) -> bool {
        self.trigger == HookTrigger::Create
    }

    /// Whether the hook fires for an observed state pair.
    pub fn matches(&self, key: &TransitionKey) -> bool {
        self.trigger.key().as_ref() == Some(key)
    }
}
