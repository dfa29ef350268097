//! Hook registry: parses hook rules once at start-up.

use super::{Hook, HookSpec, HookTrigger};
use crate::error::{FleetError, Result};
use crate::types::{LcmState, TransitionKey, VmState};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The ordered set of configured hooks.
#[derive(Debug, Clone)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
    hook_dir: PathBuf,
    remotes_dir: PathBuf,
}

impl HookRegistry {
    /// Empty registry resolving relative commands against the given directories.
    pub fn new(hook_dir: impl Into<PathBuf>, remotes_dir: impl Into<PathBuf>) -> Self {
        Self { hooks: Vec::new(), hook_dir: hook_dir.into(), remotes_dir: remotes_dir.into() }
    }

    /// Build a registry from the raw `vm_hooks` entries of the configuration.
    ///
    /// Entries that do not decode or do not validate are logged and skipped;
    /// the remaining rules are still registered.
    pub fn from_specs(
        specs: &[Value],
        hook_dir: impl Into<PathBuf>,
        remotes_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut registry = Self::new(hook_dir, remotes_dir);

        for (index, value) in specs.iter().enumerate() {
            let result =
                HookSpec::from_value(value).and_then(|spec| registry.register(&spec).map(|_| ()));
            if let Err(e) = result {
                warn!(rule = index, "{}", e);
            }
        }

        info!(
            hooks = registry.hooks.len(),
            state_tracking = registry.needs_state_tracking(),
            "Hook registry built"
        );
        registry
    }

    /// Validate a rule and append the resulting hook.
    pub fn register(&mut self, spec: &HookSpec) -> Result<&Hook> {
        let hook = parse_hook(spec, &self.hook_dir, &self.remotes_dir)?;
        info!(
            name = %hook.name,
            trigger = %hook.trigger,
            command = %hook.command,
            "Registered VM hook"
        );
        self.hooks.push(hook);
        Ok(&self.hooks[self.hooks.len() - 1])
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// True when at least one hook fires on a state pair, i.e. state
    /// observations must be turned into edges.
    pub fn needs_state_tracking(&self) -> bool {
        self.hooks.iter().any(|hook| !hook.is_create())
    }

    /// Hooks fired on VM allocation.
    pub fn on_create(&self) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(|hook| hook.is_create())
    }

    /// Hooks fired when a VM enters `key`.
    pub fn matching<'a>(&'a self, key: &'a TransitionKey) -> impl Iterator<Item = &'a Hook> {
        self.hooks.iter().filter(move |hook| hook.matches(key))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Turn a rule into a hook, resolving its command path.
pub fn parse_hook(spec: &HookSpec, hook_dir: &Path, remotes_dir: &Path) -> Result<Hook> {
    let (on, command) = match (non_empty(&spec.on), non_empty(&spec.command)) {
        (Some(on), Some(command)) => (on, command),
        _ => {
            return Err(FleetError::InvalidHook {
                reason: "Empty ON or COMMAND attribute in VM_HOOK".to_string(),
            })
        }
    };

    let remote = spec.remote.unwrap_or(false);
    let name = non_empty(&spec.name).unwrap_or(command).to_string();

    let command = if command.starts_with('/') {
        command.to_string()
    } else if remote {
        remotes_dir.join("hooks").join(command).to_string_lossy().to_string()
    } else {
        hook_dir.join(command).to_string_lossy().to_string()
    };

    let trigger = if on.eq_ignore_ascii_case("CUSTOM") {
        HookTrigger::Custom(custom_key(spec)?)
    } else {
        HookTrigger::from_keyword(on).ok_or_else(|| FleetError::InvalidHook {
            reason: format!("Unknown VM_HOOK {}", on.to_uppercase()),
        })?
    };

    // There is no host yet when a VM is allocated
    let remote = remote && trigger != HookTrigger::Create;

    Ok(Hook {
        name,
        trigger,
        command,
        arguments: spec.arguments.clone().unwrap_or_default(),
        remote,
    })
}

fn custom_key(spec: &HookSpec) -> Result<TransitionKey> {
    let lcm_str = spec.lcm_state.as_deref().unwrap_or_default();
    let lcm_state: LcmState = lcm_str.parse().map_err(|_| FleetError::InvalidHook {
        reason: format!("Wrong LCM_STATE: {}", lcm_str),
    })?;

    let vm_str = spec.state.as_deref().unwrap_or_default();
    let state: VmState = vm_str
        .parse()
        .map_err(|_| FleetError::InvalidHook { reason: format!("Wrong STATE: {}", vm_str) })?;

    Ok(TransitionKey::new(state, lcm_state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(specs: &[HookSpec]) -> HookRegistry {
        let values: Vec<Value> = specs.iter().map(|s| serde_json::to_value(s).unwrap()).collect();
        HookRegistry::from_specs(&values, "/srv/fleet/hooks", "/srv/fleet/remotes")
    }

    #[test]
    fn test_name_defaults_to_command() {
        let reg = registry(&[HookSpec::new("RUNNING", "/usr/bin/notify")]);
        assert_eq!(reg.hooks()[0].name, "/usr/bin/notify");
        assert_eq!(reg.hooks()[0].command, "/usr/bin/notify");
    }

    #[test]
    fn test_relative_command_resolution() {
        let local = HookSpec { name: Some("local".into()), ..HookSpec::new("RUNNING", "log.sh") };
        let remote = HookSpec { remote: Some(true), ..HookSpec::new("RUNNING", "net.sh") };

        let reg = registry(&[local, remote]);

        assert_eq!(reg.hooks()[0].name, "local");
        assert_eq!(reg.hooks()[0].command, "/srv/fleet/hooks/log.sh");
        assert!(!reg.hooks()[0].remote);
        assert_eq!(reg.hooks()[1].command, "/srv/fleet/remotes/hooks/net.sh");
        assert!(reg.hooks()[1].remote);
    }

    #[test]
    fn test_missing_on_or_command_skipped() {
        let specs = [
            HookSpec { command: Some("/bin/true".into()), ..Default::default() },
            HookSpec { on: Some("RUNNING".into()), ..Default::default() },
            HookSpec::new("", "/bin/true"),
            HookSpec::new("RUNNING", "  "),
        ];
        let reg = registry(&specs);
        assert!(reg.is_empty());
        assert!(!reg.needs_state_tracking());
    }

    #[test]
    fn test_invalid_rules_do_not_stop_registration() {
        let specs = [
            HookSpec::new("REBOOT", "/bin/true"),
            HookSpec {
                lcm_state: Some("RUNNING".into()),
                state: Some("SPINNING".into()),
                ..HookSpec::new("CUSTOM", "/bin/true")
            },
            HookSpec {
                lcm_state: Some("WARP".into()),
                state: Some("ACTIVE".into()),
                ..HookSpec::new("custom", "/bin/true")
            },
            HookSpec::new("CUSTOM", "/bin/true"),
            HookSpec::new("done", "/bin/cleanup"),
        ];
        let reg = registry(&specs);

        assert_eq!(reg.hooks().len(), 1);
        assert_eq!(reg.hooks()[0].command, "/bin/cleanup");
    }

    #[test]
    fn test_malformed_entries_skipped_individually() {
        let values = [
            serde_json::json!({ "ON": "RUNNING", "COMMAND": "/bin/a" }),
            serde_json::json!({ "ON": "DONE", "COMMAND": "/bin/b", "REMOTE": "maybe" }),
            serde_json::json!({ "ON": ["DONE"], "COMMAND": "/bin/c" }),
            serde_json::json!(42),
            serde_json::json!({ "ON": "stop", "COMMAND": "/bin/d", "REMOTE": "no" }),
        ];
        let reg = HookRegistry::from_specs(&values, "/h", "/r");

        let commands: Vec<_> = reg.hooks().iter().map(|h| h.command.as_str()).collect();
        assert_eq!(commands, vec!["/bin/a", "/bin/d"]);
    }

    #[test]
    fn test_register_reports_reason() {
        let mut reg = HookRegistry::new("/h", "/r");
        let err = reg.register(&HookSpec::new("REBOOT", "/bin/true")).unwrap_err();
        assert!(err.to_string().contains("Unknown VM_HOOK REBOOT"));

        let spec = HookSpec {
            lcm_state: Some("BOOT".into()),
            state: Some("active".into()),
            ..HookSpec::new("CUSTOM", "/bin/true")
        };
        let hook = reg.register(&spec).unwrap();
        assert_eq!(
            hook.trigger,
            HookTrigger::Custom(TransitionKey::new(VmState::Active, LcmState::Boot))
        );
    }

    #[test]
    fn test_state_tracking_and_matching() {
        let reg = registry(&[
            HookSpec::new("CREATE", "/bin/a"),
            HookSpec::new("RUNNING", "/bin/b"),
            HookSpec::new("running", "/bin/c"),
        ]);
        assert!(reg.needs_state_tracking());
        assert_eq!(reg.on_create().count(), 1);

        let running = TransitionKey::new(VmState::Active, LcmState::Running);
        let names: Vec<_> = reg.matching(&running).map(|h| h.command.as_str()).collect();
        assert_eq!(names, vec!["/bin/b", "/bin/c"]);

        let boot = TransitionKey::new(VmState::Active, LcmState::Boot);
        assert_eq!(reg.matching(&boot).count(), 0);
    }

    #[test]
    fn test_create_hooks_run_locally() {
        let spec = HookSpec { remote: Some(true), ..HookSpec::new("CREATE", "register.sh") };
        let reg = registry(&[spec]);
        assert!(!reg.hooks()[0].remote);
        assert!(!reg.needs_state_tracking());
    }
}
