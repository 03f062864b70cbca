//! Command-line construction for the agent CLI.
//!
//! Pure functions: given a request and the session identity to use, decide
//! the argument vector, environment and working directory. Nothing here
//! touches a process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::SupervisorError;
use crate::events::{InvocationMode, InvocationRequest};

/// Environment variable asking the agent for the streaming output dialect.
///
/// Set regardless of mode; some CLI builds honour it, some ignore it, and
/// the dialect translators accept either output.
pub const OUTPUT_FORMAT_ENV: &str = "CLAUDE_CODE_OUTPUT_FORMAT";
pub const OUTPUT_FORMAT_STREAM: &str = "stream-json";

/// How the process should attach to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionArg<'a> {
    /// `--resume <id>`
    Resume(&'a str),
    /// `--session-id <id>`
    New(&'a str),
}

/// Everything needed to launch the agent for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// Keep stdin open for [`super::Supervisor::send`].
    pub interactive: bool,
}

/// Working directory resolution: explicit > project path > current dir.
pub fn resolve_working_dir(request: &InvocationRequest) -> Result<PathBuf, SupervisorError> {
    let dir = match (&request.working_directory, &request.project_path) {
        (Some(dir), _) | (None, Some(dir)) => dir.clone(),
        (None, None) => std::env::current_dir().map_err(SupervisorError::WorkingDirectory)?,
    };
    if !dir.is_dir() {
        return Err(SupervisorError::MissingDirectory(dir));
    }
    Ok(dir)
}

/// Build the argument vector for `request`.
///
/// - batch: `-p <prompt> --output-format json`
/// - streaming with a prompt: `-p <prompt> --output-format stream-json --verbose --include-partial-messages`
/// - streaming without a prompt: prompts arrive on stdin as stream-json
///
/// New sessions get `--session-id` and, if requested, `--model`. Resumed
/// sessions get `--resume` and never a model: the CLI keeps the original.
pub fn build_args(
    request: &InvocationRequest,
    session: SessionArg<'_>,
    extra_args: &[String],
) -> Vec<String> {
    let mut args = vec!["-p".to_string()];

    match request.mode() {
        InvocationMode::Batch => {
            args.extend(request.prompt_text().map(str::to_string));
            args.extend(["--output-format", "json"].map(str::to_string));
        }
        InvocationMode::Streaming => {
            match request.prompt_text() {
                Some(prompt) => args.push(prompt.to_string()),
                None => args.extend(["--input-format", OUTPUT_FORMAT_STREAM].map(str::to_string)),
            }
            args.extend(
                [
                    "--output-format",
                    OUTPUT_FORMAT_STREAM,
                    "--verbose",
                    "--include-partial-messages",
                ]
                .map(str::to_string),
            );
        }
    }

    match session {
        SessionArg::Resume(id) => {
            args.extend(["--resume".to_string(), id.to_string()]);
        }
        SessionArg::New(id) => {
            args.extend(["--session-id".to_string(), id.to_string()]);
            if let Some(model) = request.model.as_deref().filter(|m| !m.trim().is_empty()) {
                args.extend(["--model".to_string(), model.to_string()]);
            }
        }
    }

    args.extend(extra_args.iter().cloned());
    args
}

/// Assemble the full [`CommandSpec`].
pub fn command_spec(
    program: &str,
    request: &InvocationRequest,
    session: SessionArg<'_>,
    extra_args: &[String],
    extra_env: &BTreeMap<String, String>,
) -> Result<CommandSpec, SupervisorError> {
    let mut env = extra_env.clone();
    env.insert(OUTPUT_FORMAT_ENV.to_string(), OUTPUT_FORMAT_STREAM.to_string());

    Ok(CommandSpec {
        program: program.to_string(),
        args: build_args(request, session, extra_args),
        env,
        working_dir: resolve_working_dir(request)?,
        interactive: request.is_interactive(),
    })
}
