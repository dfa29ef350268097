//! Hook dispatch: argument rendering, the job queue and command execution.
//!
//! Callers only ever enqueue. A single worker task drains the queue and spawns
//! each job as its own task, bounded by a semaphore, so a slow hook never
//! delays the code path that produced the edge. Shutting the dispatcher down
//! waits for the hooks already launched.

use super::{Hook, Transition};
use crate::error::{FleetError, Result};
use crate::types::{TransitionKey, Vm};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder pattern is valid"));

/// One hook invocation, fully rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookJob {
    pub hook_name: String,
    pub command: String,
    /// One entry per template word, placeholders substituted
    pub arguments: Vec<String>,
    pub remote: bool,
    /// Host to run on, required when `remote`
    pub host: Option<String>,
    pub vm_id: i64,
}

/// Runs a hook job to completion.
#[async_trait::async_trait]
pub trait HookExecutor: Send + Sync {
    async fn execute(&self, job: &HookJob) -> Result<()>;
}

/// Executes hooks as child processes.
///
/// Local hooks get their arguments as separate argv entries. Remote hooks run
/// through `remote_shell <host> "<command> <arguments>"` with every word
/// shell-quoted, since the remote side parses the line again.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    remote_shell: String,
}

impl ProcessExecutor {
    pub fn new(remote_shell: impl Into<String>) -> Self {
        Self { remote_shell: remote_shell.into() }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new("ssh")
    }
}

#[async_trait::async_trait]
impl HookExecutor for ProcessExecutor {
    #[instrument(skip(self, job), fields(hook = %job.hook_name, vm_id = job.vm_id))]
    async fn execute(&self, job: &HookJob) -> Result<()> {
        let failed =
            |reason: String| FleetError::HookFailed { hook: job.hook_name.clone(), reason };

        let output = if job.remote {
            let host = job
                .host
                .as_deref()
                .ok_or_else(|| failed("remote hook without a host".to_string()))?;

            let remote_command = remote_command_line(&job.command, &job.arguments);

            debug!("Running {} on {} via {}", remote_command, host, self.remote_shell);
            Command::new(&self.remote_shell).arg(host).arg(remote_command).output().await
        } else {
            debug!("Running {} {:?}", job.command, job.arguments);
            Command::new(&job.command).args(&job.arguments).output().await
        }
        .map_err(|e| failed(format!("Failed to execute {}: {}", job.command, e)))?;

        if !output.status.success() {
            return Err(failed(format!(
                "{} ({})",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

/// `command` and its arguments as one line for a remote shell.
pub fn remote_command_line(command: &str, arguments: &[String]) -> String {
    std::iter::once(command)
        .chain(arguments.iter().map(String::as_str))
        .map(shell_words::quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fire-and-forget hook launcher.
pub struct HookDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<HookJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HookDispatcher {
    /// Start the dispatch worker. Must be called inside a tokio runtime.
    pub fn new(executor: Arc<dyn HookExecutor>, max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let worker = tokio::spawn(run_worker(receiver, executor, semaphore));

        Self { sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
    }

    /// Launch the creation hooks of a freshly allocated VM.
    pub fn dispatch_create<'a>(
        &self,
        hooks: impl IntoIterator<Item = &'a Hook>,
        vm: &Vm,
    ) -> usize {
        hooks.into_iter().filter(|hook| self.enqueue(hook, vm, None)).count()
    }

    /// Launch the hooks matching an edge.
    pub fn dispatch_transition<'a>(
        &self,
        hooks: impl IntoIterator<Item = &'a Hook>,
        vm: &Vm,
        transition: &Transition,
    ) -> usize {
        hooks.into_iter().filter(|hook| self.enqueue(hook, vm, transition.previous)).count()
    }

    fn enqueue(&self, hook: &Hook, vm: &Vm, previous: Option<TransitionKey>) -> bool {
        if hook.remote && vm.hostname.is_none() {
            warn!(hook = %hook.name, vm_id = vm.oid, "Remote hook skipped, VM has no host");
            return false;
        }

        let job = HookJob {
            hook_name: hook.name.clone(),
            command: hook.command.clone(),
            arguments: render_arguments(&hook.arguments, vm, previous),
            remote: hook.remote,
            host: vm.hostname.clone(),
            vm_id: vm.oid,
        };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref().map(|tx| tx.send(job)) {
            Some(Ok(())) => {
                metrics::counter!("fleet_hooks_dispatched_total", "hook" => hook.name.clone())
                    .increment(1);
                true
            }
            _ => {
                warn!(hook = %hook.name, vm_id = vm.oid, "Hook dispatcher stopped, hook dropped");
                false
            }
        }
    }

    /// Close the queue and wait for every queued hook to run to completion.
    ///
    /// Hooks enqueued afterwards are dropped with a warning.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Hook dispatch worker ended abnormally: {}", e);
            }
        }
        info!("Hook dispatcher stopped");
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<HookJob>,
    executor: Arc<dyn HookExecutor>,
    semaphore: Arc<Semaphore>,
) {
    let mut running = JoinSet::new();

    loop {
        let job = tokio::select! {
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
            Some(_) = running.join_next() => continue,
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let executor = executor.clone();

        running.spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            match executor.execute(&job).await {
                Ok(()) => info!(hook = %job.hook_name, vm_id = job.vm_id, "Hook executed"),
                Err(e) => {
                    metrics::counter!("fleet_hook_failures_total", "hook" => job.hook_name.clone())
                        .increment(1);
                    warn!(vm_id = job.vm_id, "{}", e);
                }
            }

            metrics::histogram!("fleet_hook_duration_seconds")
                .record(started.elapsed().as_secs_f64());
        });
    }

    // Queue closed: let in-flight hooks finish
    while running.join_next().await.is_some() {}
}

/// Render a hook argument template into the argument list.
///
/// The template is split on whitespace first, then `$PLACEHOLDER`s are
/// substituted in each word, so a value containing spaces stays a single
/// argument. Unknown placeholders render as the empty string; the argument
/// is kept so later positions do not shift.
pub fn render_arguments(template: &str, vm: &Vm, previous: Option<TransitionKey>) -> Vec<String> {
    template
        .split_whitespace()
        .map(|word| {
            if !word.contains('$') {
                return word.to_string();
            }
            PLACEHOLDER
                .replace_all(word, |caps: &Captures<'_>| placeholder_value(&caps[1], vm, previous))
                .into_owned()
        })
        .collect()
}

fn placeholder_value(name: &str, vm: &Vm, previous: Option<TransitionKey>) -> String {
    match name {
        "ID" => vm.oid.to_string(),
        "NAME" => vm.name.clone(),
        "UID" => vm.uid.to_string(),
        "GID" => vm.gid.to_string(),
        "UNAME" => vm.uname.clone(),
        "GNAME" => vm.gname.clone(),
        "HOSTNAME" => vm.hostname.clone().unwrap_or_default(),
        "STATE" => vm.state.to_string(),
        "LCM_STATE" => vm.lcm_state.to_string(),
        "PREV_STATE" => previous.map(|key| key.state.to_string()).unwrap_or_default(),
        "PREV_LCM_STATE" => previous.map(|key| key.lcm_state.to_string()).unwrap_or_default(),
        "CPU" => vm.template.cpu.to_string(),
        "MEMORY" => vm.template.memory.to_string(),
        "TEMPLATE" => match serde_json::to_vec(vm) {
            Ok(json) => base64::engine::general_purpose::STANDARD.encode(json),
            Err(e) => {
                warn!(vm_id = vm.oid, "Failed to encode VM template: {}", e);
                String::new()
            }
        },
        attribute => vm.template.attributes.get(attribute).cloned().unwrap_or_default(),
    }
}
