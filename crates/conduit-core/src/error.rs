//! Error types for the adapter.
//!
//! Only [`SupervisorError`] ever crosses the [`crate::Orchestrator`]
//! boundary; [`ParseFailure`] is consumed inside the stream pipeline and
//! logged.

use std::path::PathBuf;

/// A candidate line that could not be decoded as a JSON envelope.
///
/// Carries the raw line so callers can log it. Producing one of these is
/// routine: agent CLIs interleave banners and ANSI output with JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a JSON envelope: {reason}")]
pub struct ParseFailure {
    /// The line exactly as it was framed.
    pub raw: String,
    /// Decoder message.
    pub reason: String,
}

/// Errors raised by process lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent binary at '{binary}' -- is it installed and on PATH?")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine a working directory")]
    WorkingDirectory(#[source] std::io::Error),

    #[error("working directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("child process has no stdio pipes")]
    MissingPipes,

    #[error("session {0} already has an active process")]
    SessionBusy(String),

    #[error("no active process for session {0}")]
    NotFound(String),

    #[error("session {0} does not accept interactive input")]
    InputClosed(String),

    #[error("failed to write to agent stdin")]
    Input(#[source] std::io::Error),
}
