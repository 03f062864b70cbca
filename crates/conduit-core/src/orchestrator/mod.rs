//! Composition root: one call per invocation.
//!
//! [`Orchestrator::invoke`] decides the pre-spawn session identity, spawns
//! the agent through the [`Supervisor`], and hands the child to a pump task
//! that drains stdout and stderr, waits for the exit and publishes canonical
//! events to the caller's [`EventSink`].

mod invocation;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::OptionFuture;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Sleep;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::events::{EventSink, InvocationRequest, OutboundEvent};
use crate::session::SessionReconciler;
use crate::supervisor::{self, EntryId, SessionArg, SpawnedProcess, Supervisor, SupervisorConfig};

pub use invocation::InvocationOutcome;

use invocation::Invocation;

/// Default grace period between SIGTERM and a hard kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Default capacity of the channel behind [`Orchestrator::invoke_stream`].
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// How long output is still read after the agent exits. A background
/// process that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Per-invocation behaviour shared by every call on one [`Orchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Text published as a `response-delta` right after a successful spawn.
    pub acknowledgment: Option<String>,
    /// Terminate the agent if it runs longer than this.
    pub timeout: Option<Duration>,
    /// How long a terminated agent gets before it is killed outright.
    pub kill_grace: Duration,
    /// Capacity of the bounded channel used by [`Orchestrator::invoke_stream`].
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            acknowledgment: None,
            timeout: None,
            kill_grace: DEFAULT_KILL_GRACE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// A running invocation.
#[derive(Debug)]
pub struct InvocationHandle {
    session_id: String,
    entry_id: EntryId,
    pid: Option<u32>,
    task: JoinHandle<InvocationOutcome>,
}

impl InvocationHandle {
    /// Identity the process was registered under at spawn time. Valid for
    /// [`Orchestrator::cancel`] for the whole run, even after the agent
    /// reports a different one.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Registry id of this run's process. Unlike session identities it is
    /// never reused; see [`Orchestrator::cancel_entry`].
    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the completion event has been published.
    pub async fn wait(self) -> Result<InvocationOutcome, JoinError> {
        self.task.await
    }
}

/// Launches agent invocations and routes their output.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    supervisor: Arc<Supervisor>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(supervisor: SupervisorConfig, config: OrchestratorConfig) -> Self {
        Self {
            supervisor: Arc::new(Supervisor::new(supervisor)),
            config,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start one invocation, publishing its events to `sink`.
    ///
    /// Spawn failures are returned here and publish nothing.
    pub async fn invoke(
        &self,
        request: InvocationRequest,
        sink: Arc<dyn EventSink>,
    ) -> Result<InvocationHandle, SupervisorError> {
        let reconciler = match request.resume_target() {
            Some(prior) => SessionReconciler::resuming(prior),
            None => SessionReconciler::fresh(Uuid::new_v4().to_string()),
        };
        let key = reconciler.current().to_string();
        let session = if reconciler.is_resume() {
            SessionArg::Resume(&key)
        } else {
            SessionArg::New(&key)
        };

        let process = self.supervisor.spawn(&request, &key, session).await?;

        let mut invocation = Invocation::new(
            &request,
            reconciler,
            sink,
            Arc::clone(&self.supervisor),
            process.entry_id,
        );
        if let Some(text) = &self.config.acknowledgment {
            invocation.acknowledge(text).await;
        }

        let pid = process.pid;
        let entry_id = process.entry_id;
        let task = tokio::spawn(pump(invocation, process, self.config.clone()));
        Ok(InvocationHandle {
            session_id: key,
            entry_id,
            pid,
            task,
        })
    }

    /// Start one invocation and return its events as a stream.
    ///
    /// The stream ends after the `completion` event. A slow consumer applies
    /// backpressure up to the agent's stdout pipe.
    pub async fn invoke_stream(
        &self,
        request: InvocationRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = OutboundEvent> + Send>>, SupervisorError> {
        let (tx, mut rx) = mpsc::channel(self.config.event_buffer.max(1));
        let handle = self.invoke(request, Arc::new(tx)).await?;

        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
            if let Err(e) = handle.wait().await {
                warn!(error = %e, "invocation task failed");
            }
        };
        Ok(Box::pin(stream))
    }

    /// Terminate the invocation known as `identity`. Returns whether one was
    /// found.
    pub async fn cancel(&self, identity: &str) -> bool {
        self.supervisor.cancel(identity).await
    }

    /// Terminate the invocation whose process has registry id `entry`.
    pub async fn cancel_entry(&self, entry: EntryId) -> bool {
        self.supervisor.cancel_entry(entry).await
    }

    /// Whether the process with registry id `entry` is still registered.
    pub async fn is_active(&self, entry: EntryId) -> bool {
        self.supervisor.registry().contains_entry(entry).await
    }

    /// Send a follow-up prompt to an interactive invocation.
    pub async fn send(&self, identity: &str, text: &str) -> Result<(), SupervisorError> {
        self.supervisor.send(identity, text).await
    }

    /// Signal end of input to an interactive invocation.
    pub async fn close_input(&self, identity: &str) -> Result<(), SupervisorError> {
        self.supervisor.close_input(identity).await
    }
}

/// Drive one child to exit and publish the terminal events.
///
/// The exit status is awaited alongside the output pipes. Once the agent has
/// exited, remaining output is read for at most [`OUTPUT_DRAIN_GRACE`], and a
/// cancellation stops reading at once.
async fn pump(
    mut invocation: Invocation,
    process: SpawnedProcess,
    config: OrchestratorConfig,
) -> InvocationOutcome {
    let SpawnedProcess {
        pid,
        mut child,
        stdout,
        stderr,
        cancel,
        ..
    } = process;

    let mut stdout = ReaderStream::new(stdout);
    let mut stderr = ReaderStream::new(stderr);
    let mut stdout_open = true;
    let mut stderr_open = true;

    let deadline = OptionFuture::from(config.timeout.map(tokio::time::sleep));
    tokio::pin!(deadline);
    let mut terminating = false;
    let mut escalation: Option<Pin<Box<Sleep>>> = None;

    let mut exited: Option<i32> = None;
    let mut drain: Option<Pin<Box<Sleep>>> = None;
    let mut abandon_pipes = false;

    let exit_code = loop {
        if let Some(code) = exited {
            if abandon_pipes || (!stdout_open && !stderr_open) {
                break code;
            }
        }

        tokio::select! {
            chunk = stdout.next(), if stdout_open => match chunk {
                Some(Ok(bytes)) => invocation.on_stdout(&bytes).await,
                Some(Err(e)) => {
                    warn!(error = %e, "failed reading agent stdout");
                    stdout_open = false;
                }
                None => stdout_open = false,
            },
            chunk = stderr.next(), if stderr_open => match chunk {
                Some(Ok(bytes)) => invocation.on_stderr(&bytes),
                Some(Err(e)) => {
                    warn!(error = %e, "failed reading agent stderr");
                    stderr_open = false;
                }
                None => stderr_open = false,
            },
            status = child.wait(), if exited.is_none() => {
                exited = Some(match status {
                    Ok(status) => supervisor::exit_code(status),
                    Err(e) => {
                        warn!(error = %e, "failed to wait for agent process");
                        -1
                    }
                });
                escalation = None;
                drain = Some(Box::pin(tokio::time::sleep(OUTPUT_DRAIN_GRACE)));
            }
            () = cancel.cancelled(), if !terminating => {
                terminating = true;
                if exited.is_some() {
                    debug!(session_id = invocation.session_id(), "agent already exited; no longer reading its output");
                    abandon_pipes = true;
                } else {
                    debug!(session_id = invocation.session_id(), pid = ?pid, "terminating cancelled agent");
                    supervisor::terminate(&mut child);
                    escalation = Some(Box::pin(tokio::time::sleep(config.kill_grace)));
                }
            }
            Some(()) = &mut deadline, if config.timeout.is_some() && !terminating && exited.is_none() => {
                let limit = config.timeout.unwrap_or_default();
                warn!(session_id = invocation.session_id(), pid = ?pid, timeout = ?limit, "agent timed out");
                invocation.note(format!("agent timed out after {limit:?}"));
                terminating = true;
                supervisor::terminate(&mut child);
                escalation = Some(Box::pin(tokio::time::sleep(config.kill_grace)));
            }
            Some(()) = OptionFuture::from(escalation.as_mut()), if escalation.is_some() => {
                warn!(pid = ?pid, "agent ignored SIGTERM, killing");
                escalation = None;
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill failed (already exited?)");
                }
            }
            Some(()) = OptionFuture::from(drain.as_mut()), if drain.is_some() => {
                warn!(
                    session_id = invocation.session_id(),
                    pid = ?pid,
                    "agent exited but its output pipes are still open; finishing without them"
                );
                drain = None;
                abandon_pipes = true;
            }
        }
    };

    invocation.on_exit(exit_code).await
}
