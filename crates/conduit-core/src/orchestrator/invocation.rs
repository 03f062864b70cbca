//! State owned by one invocation.
//!
//! Everything the output pipeline mutates lives in [`Invocation`]: the
//! framers, the dialect, the reconciler, the completion latch and the
//! diagnostic accumulator. The pump task calls into it; nothing else does.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::completion::CompletionGuard;
use crate::events::{CanonicalEvent, EventSink, InvocationRequest, OutboundEvent};
use crate::framing::LineFramer;
use crate::protocol::{self, Dialect, Signal};
use crate::session::SessionReconciler;
use crate::supervisor::{EntryId, Supervisor};

/// Diagnostic lines kept for the `error` event; older lines are dropped.
const MAX_DIAGNOSTIC_LINES: usize = 64;

/// Final state of a finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Reported identity, or the pre-spawn identity if none was reported.
    pub session_id: String,
    /// Process exit code (signal deaths as `128 + signal`).
    pub exit_code: i32,
    /// All assistant text published during the run.
    pub response: String,
}

/// Publishes canonical events for one correlation token.
struct Emitter {
    correlation_token: String,
    sink: Arc<dyn EventSink>,
    closed: bool,
}

impl Emitter {
    async fn emit(&mut self, event: CanonicalEvent) {
        if self.closed {
            return;
        }
        let event = OutboundEvent::new(self.correlation_token.clone(), event);
        if !self.sink.emit(event).await {
            warn!(
                correlation_token = %self.correlation_token,
                "event receiver closed; discarding further events"
            );
            self.closed = true;
        }
    }
}

pub(crate) struct Invocation {
    reconciler: SessionReconciler,
    stdout: LineFramer,
    stderr: LineFramer,
    diagnostics: VecDeque<String>,
    dialect: Box<dyn Dialect>,
    /// Prompt-less runs span many turns; only the exit completes them.
    interactive: bool,
    guard: CompletionGuard,
    emitter: Emitter,
    supervisor: Arc<Supervisor>,
    entry_id: EntryId,
}

impl Invocation {
    pub(crate) fn new(
        request: &InvocationRequest,
        reconciler: SessionReconciler,
        sink: Arc<dyn EventSink>,
        supervisor: Arc<Supervisor>,
        entry_id: EntryId,
    ) -> Self {
        Self {
            reconciler,
            stdout: LineFramer::new(),
            stderr: LineFramer::new(),
            diagnostics: VecDeque::new(),
            dialect: protocol::dialect::for_mode(request.mode()),
            interactive: request.is_interactive(),
            guard: CompletionGuard::new(),
            emitter: Emitter {
                correlation_token: request.correlation_token.clone(),
                sink,
                closed: false,
            },
            supervisor,
            entry_id,
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        self.reconciler.current()
    }

    /// Publish the synthetic low-latency acknowledgment.
    pub(crate) async fn acknowledge(&mut self, text: &str) {
        self.emitter
            .emit(CanonicalEvent::ResponseDelta {
                text: text.to_string(),
            })
            .await;
    }

    pub(crate) async fn on_stdout(&mut self, chunk: &[u8]) {
        for line in self.stdout.feed(chunk) {
            self.on_line(&line).await;
        }
    }

    pub(crate) fn on_stderr(&mut self, chunk: &[u8]) {
        for line in self.stderr.feed(chunk) {
            self.record_stderr(&line);
        }
    }

    /// Add a message to the diagnostic accumulator.
    pub(crate) fn note(&mut self, message: impl Into<String>) {
        if self.diagnostics.len() == MAX_DIAGNOSTIC_LINES {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(message.into());
    }

    /// Flush buffered output, publish the terminal events and return the
    /// outcome.
    pub(crate) async fn on_exit(mut self, exit_code: i32) -> InvocationOutcome {
        if let Some(rest) = self.stdout.flush() {
            self.on_line(&rest).await;
        }
        if let Some(rest) = self.stderr.flush() {
            self.record_stderr(&rest);
        }

        self.supervisor.release(self.entry_id).await;
        let session_id = self.reconciler.finish().to_string();

        if exit_code != 0 && !self.guard.has_fired() {
            let message = if self.diagnostics.is_empty() {
                format!("agent process exited with code {exit_code}")
            } else {
                Vec::from(std::mem::take(&mut self.diagnostics)).join("\n")
            };
            self.emitter
                .emit(CanonicalEvent::Error {
                    session_id: Some(session_id.clone()),
                    message,
                })
                .await;
        }
        self.complete(exit_code).await;

        debug!(
            session_id = %session_id,
            exit_code,
            dialect = self.dialect.name(),
            response_bytes = self.dialect.transcript().len(),
            "invocation finished"
        );

        InvocationOutcome {
            session_id,
            exit_code,
            response: self.dialect.transcript().to_string(),
        }
    }

    async fn on_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match protocol::parse(line) {
            Ok(envelope) => {
                trace!(kind = envelope.label(), "agent envelope");
                for signal in self.dialect.translate(envelope) {
                    self.apply(signal).await;
                }
            }
            Err(failure) if line.starts_with(['{', '[']) => {
                warn!(line = %failure.raw, error = %failure.reason, "skipping malformed JSON line");
            }
            Err(failure) => {
                debug!(line = %failure.raw, "skipping non-JSON agent output");
            }
        }
    }

    async fn apply(&mut self, signal: Signal) {
        match signal {
            Signal::SessionReported(reported) => {
                let Some(confirmation) = self.reconciler.observe(&reported) else {
                    return;
                };
                self.supervisor
                    .rekey(&confirmation.previous, &confirmation.confirmed)
                    .await;
                if confirmation.announce {
                    self.emitter
                        .emit(CanonicalEvent::SessionCreated {
                            session_id: confirmation.confirmed,
                        })
                        .await;
                }
            }
            Signal::Delta(text) => {
                self.emitter.emit(CanonicalEvent::ResponseDelta { text }).await;
            }
            Signal::Finished if self.interactive => {
                debug!(session_id = %self.reconciler.current(), "agent turn finished");
            }
            Signal::Finished => self.complete(0).await,
            Signal::Diagnostic(message) => self.note(message),
        }
    }

    async fn complete(&mut self, exit_code: i32) {
        let is_new_session = !self.reconciler.is_resume();
        if let Some(event) = self.guard.fire(exit_code, is_new_session) {
            self.emitter.emit(event).await;
        }
    }

    fn record_stderr(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        warn!(session_id = %self.reconciler.current(), line, "agent stderr");
        self.note(line);
    }
}
