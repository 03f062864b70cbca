//! Agent CLI process lifecycle.
//!
//! The [`Supervisor`] spawns one child per invocation, records it in the
//! [`ProcessRegistry`], and offers cancellation and interactive input by
//! session identity.
//!
//! ```text
//! spawn(request, key) --> Command (args/env/cwd from `command`)
//!        |                   |
//!        |                   v
//!        |             SpawnedProcess { child, stdout, stderr, cancel }
//!        v
//! registry.insert(key) ... rekey(key, reported) ... release(id)
//!                     cancel(identity) --> CancellationToken
//! ```

pub mod command;
pub mod registry;

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::events::InvocationRequest;

pub use command::{CommandSpec, SessionArg};
pub use registry::{EntryId, ProcessEntry, ProcessRegistry};

/// Static configuration for launching the agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Path to the agent binary. Defaults to `"claude"` (found via `$PATH`).
    pub binary: String,
    /// Arguments appended to every invocation.
    pub extra_args: Vec<String>,
    /// Environment variables merged into the child's environment.
    pub env: BTreeMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Useful for tests or when the CLI is installed in a non-standard
    /// location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
            ..Self::default()
        }
    }
}

/// A freshly spawned child and the pipes its owner must drain.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub entry_id: EntryId,
    pub pid: Option<u32>,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Cancelled by [`Supervisor::cancel`].
    pub cancel: CancellationToken,
}

/// Spawns agent processes and tracks the live ones.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    config: SupervisorConfig,
    registry: ProcessRegistry,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            registry: ProcessRegistry::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Build the command for `request` without running it.
    pub fn command_for(
        &self,
        request: &InvocationRequest,
        session: SessionArg<'_>,
    ) -> Result<CommandSpec, SupervisorError> {
        command::command_spec(
            &self.config.binary,
            request,
            session,
            &self.config.extra_args,
            &self.config.env,
        )
    }

    /// Launch the agent for `request` and register it under `key`.
    ///
    /// Fails with [`SupervisorError::SessionBusy`] while another live process
    /// is registered under `key`.
    pub async fn spawn(
        &self,
        request: &InvocationRequest,
        key: &str,
        session: SessionArg<'_>,
    ) -> Result<SpawnedProcess, SupervisorError> {
        let spec = self.command_for(request, session)?;
        if self.registry.contains(key).await {
            return Err(SupervisorError::SessionBusy(key.to_string()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(if spec.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "could not kill child without pipes");
            }
            return Err(SupervisorError::MissingPipes);
        };
        let stdin = child.stdin.take();

        let cancel = CancellationToken::new();
        let Some(entry_id) = self
            .registry
            .insert(key, ProcessEntry::new(pid, cancel.clone(), stdin))
            .await
        else {
            // Lost a race with a concurrent spawn for the same session.
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "could not kill duplicate child");
            }
            return Err(SupervisorError::SessionBusy(key.to_string()));
        };

        info!(
            session_id = key,
            pid = ?pid,
            mode = ?request.mode(),
            working_dir = %spec.working_dir.display(),
            "spawned agent process"
        );

        Ok(SpawnedProcess {
            entry_id,
            pid,
            child,
            stdout,
            stderr,
            cancel,
        })
    }

    /// Terminate the process registered under `identity`.
    ///
    /// Returns whether an entry was found. The entry is removed immediately;
    /// the exit itself is reported later by the task that owns the child.
    pub async fn cancel(&self, identity: &str) -> bool {
        match self.registry.remove(identity).await {
            Some(entry) => {
                info!(session_id = identity, pid = ?entry.pid(), "cancelling agent process");
                entry.request_termination();
                true
            }
            None => {
                debug!(session_id = identity, "cancel requested for unknown session");
                false
            }
        }
    }

    /// Terminate one specific process, whatever keys it is reachable under.
    pub async fn cancel_entry(&self, id: EntryId) -> bool {
        match self.registry.take(id).await {
            Some(entry) => {
                info!(entry_id = id, pid = ?entry.pid(), "cancelling agent process");
                entry.request_termination();
                true
            }
            None => false,
        }
    }

    /// Send a user message to an interactive (prompt-less) process.
    pub async fn send(&self, identity: &str, text: &str) -> Result<(), SupervisorError> {
        let entry = self
            .registry
            .get(identity)
            .await
            .ok_or_else(|| SupervisorError::NotFound(identity.to_string()))?;

        let line = user_message_line(text);
        let written = entry
            .write_input(line.as_bytes())
            .await
            .map_err(SupervisorError::Input)?;
        if !written {
            return Err(SupervisorError::InputClosed(identity.to_string()));
        }
        debug!(session_id = identity, bytes = line.len(), "sent input to agent");
        Ok(())
    }

    /// Close the stdin of an interactive process, ending its input.
    pub async fn close_input(&self, identity: &str) -> Result<(), SupervisorError> {
        let entry = self
            .registry
            .get(identity)
            .await
            .ok_or_else(|| SupervisorError::NotFound(identity.to_string()))?;
        if !entry.close_input().await {
            return Err(SupervisorError::InputClosed(identity.to_string()));
        }
        debug!(session_id = identity, "closed agent stdin");
        Ok(())
    }

    /// Make the process registered as `from` reachable as `to`.
    pub async fn rekey(&self, from: &str, to: &str) -> bool {
        let found = self.registry.rekey(from, to).await;
        if !found {
            debug!(from, to, "rekey skipped; process no longer registered");
        }
        found
    }

    /// Drop the registry entry of an exited process.
    pub async fn release(&self, id: EntryId) {
        self.registry.release(id).await;
    }
}

/// Encode `text` as one stream-json user message line.
pub fn user_message_line(text: &str) -> String {
    let message = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    });
    format!("{message}\n")
}

/// Ask `child` to stop: SIGTERM on Unix, a hard kill elsewhere or if the
/// signal cannot be delivered.
pub(crate) fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a child we spawned and have not reaped yet.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret == 0 {
                return;
            }
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed (already exited?)");
    }
}

/// Numeric exit code; signal deaths map to `128 + signal` on Unix.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
