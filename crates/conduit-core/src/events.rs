//! Invocation requests and the canonical outbound event vocabulary.
//!
//! Every event a caller ever observes is one of the four
//! [`CanonicalEvent`] kinds, wrapped in an [`OutboundEvent`] that echoes the
//! caller's correlation token so many invocations can share one channel.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Immutable input to one run of the agent CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    /// Session to resume. `None` starts a new session.
    #[serde(default)]
    pub prior_session_id: Option<String>,
    /// Explicit working directory; wins over `project_path`.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Project root, used when no explicit working directory is given.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    /// Model selector. Ignored when resuming.
    #[serde(default)]
    pub model: Option<String>,
    /// One-shot prompt. `None` selects the continuous streaming mode.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Request the streaming dialect even when a prompt is supplied.
    #[serde(default)]
    pub streaming: bool,
    /// Opaque caller token echoed on every outbound event.
    pub correlation_token: String,
}

/// Which output dialect an invocation asks the agent CLI for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    /// Single prompt, machine-readable batch JSON.
    Batch,
    /// Incremental stream-json envelopes.
    Streaming,
}

impl InvocationRequest {
    pub fn new(correlation_token: impl Into<String>) -> Self {
        Self {
            correlation_token: correlation_token.into(),
            ..Self::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.prior_session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn in_project(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn streamed(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// The session being resumed, ignoring blank identifiers.
    pub fn resume_target(&self) -> Option<&str> {
        self.prior_session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn is_resume(&self) -> bool {
        self.resume_target().is_some()
    }

    /// The prompt, ignoring blank strings.
    pub fn prompt_text(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// No prompt: user messages arrive later over stdin.
    pub fn is_interactive(&self) -> bool {
        self.prompt_text().is_none()
    }

    pub fn mode(&self) -> InvocationMode {
        if self.streaming || self.is_interactive() {
            InvocationMode::Streaming
        } else {
            InvocationMode::Batch
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// The closed set of events the adapter publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CanonicalEvent {
    /// The agent confirmed the identity of a brand-new session.
    SessionCreated { session_id: String },
    /// A fragment of assistant text, to be concatenated by the caller.
    ResponseDelta { text: String },
    /// The invocation finished. Emitted exactly once.
    Completion { exit_code: i32, is_new_session: bool },
    /// The invocation failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

/// A canonical event addressed to one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub correlation_token: String,
    #[serde(flatten)]
    pub event: CanonicalEvent,
}

impl OutboundEvent {
    pub fn new(correlation_token: impl Into<String>, event: CanonicalEvent) -> Self {
        Self {
            correlation_token: correlation_token.into(),
            event,
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Destination for outbound events.
///
/// Implementations must preserve emission order. `emit` returns `false` once
/// the receiving side is gone; the invocation keeps running regardless.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: OutboundEvent) -> bool;
}

/// Bounded channel: emission waits for capacity, which in turn stops the
/// stdout reader and lets the OS pipe throttle the child.
#[async_trait]
impl EventSink for mpsc::Sender<OutboundEvent> {
    async fn emit(&self, event: OutboundEvent) -> bool {
        self.send(event).await.is_ok()
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<OutboundEvent> {
    async fn emit(&self, event: OutboundEvent) -> bool {
        self.send(event).is_ok()
    }
}
