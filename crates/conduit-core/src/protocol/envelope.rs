//! Envelope decoding.
//!
//! The agent CLI's output schema is not contractually fixed, so decoding is
//! permissive: anything that is valid JSON becomes an [`Envelope`], with
//! unfamiliar shapes landing in [`Envelope::Unknown`]. Only text that is not
//! JSON at all produces a [`ParseFailure`].

use serde_json::Value;

use crate::error::ParseFailure;

/// One decoded unit of agent CLI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Incremental assistant text (`stream_event` / `content_block_delta`).
    TextDelta { text: String },
    /// A complete assistant message. `text` joins all text blocks.
    AssistantMessage {
        text: String,
        session_id: Option<String>,
    },
    /// The typed `result` envelope that ends a turn.
    TerminalResult {
        text: String,
        is_error: bool,
        session_id: Option<String>,
    },
    /// An envelope without a recognised type tag exposing a `result` or
    /// `output` string, as emitted by older CLI builds.
    LegacyOutput {
        text: String,
        session_id: Option<String>,
    },
    /// System / metadata envelope, e.g. `{"type":"system","subtype":"init"}`.
    System { session_id: Option<String> },
    /// An error reported in-band by the agent.
    AgentError { message: String },
    /// Valid JSON of an unrecognised shape.
    Unknown { kind: Option<String> },
}

impl Envelope {
    /// The session identifier this envelope reports, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::AssistantMessage { session_id, .. }
            | Self::TerminalResult { session_id, .. }
            | Self::LegacyOutput { session_id, .. }
            | Self::System { session_id } => session_id.as_deref(),
            Self::TextDelta { .. } | Self::AgentError { .. } | Self::Unknown { .. } => None,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::AssistantMessage { .. } => "assistant",
            Self::TerminalResult { .. } => "result",
            Self::LegacyOutput { .. } => "legacy_output",
            Self::System { .. } => "system",
            Self::AgentError { .. } => "error",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Decode one framed line.
///
/// Never panics and never fails on well-formed JSON; callers should log the
/// returned [`ParseFailure`] and keep reading.
pub fn parse(line: &str) -> Result<Envelope, ParseFailure> {
    let value: Value = serde_json::from_str(line).map_err(|e| ParseFailure {
        raw: line.to_string(),
        reason: e.to_string(),
    })?;
    Ok(classify(&value))
}

/// Map a decoded JSON value onto an [`Envelope`] variant.
pub fn classify(value: &Value) -> Envelope {
    if let Value::Array(items) = value {
        return classify_transcript(items);
    }
    let Some(obj) = value.as_object() else {
        return Envelope::Unknown { kind: None };
    };

    let session_id = ["session_id", "sessionId"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string);

    let kind = obj.get("type").and_then(Value::as_str);

    match kind {
        Some("system") => Envelope::System { session_id },

        // Partial-message mode wraps the raw API event.
        Some("stream_event") => match value.get("event").and_then(text_delta) {
            Some(text) => Envelope::TextDelta { text },
            None => Envelope::Unknown {
                kind: Some("stream_event".to_string()),
            },
        },

        Some("content_block_delta") => match text_delta(value) {
            Some(text) => Envelope::TextDelta { text },
            None => Envelope::Unknown {
                kind: Some("content_block_delta".to_string()),
            },
        },

        Some("assistant") => Envelope::AssistantMessage {
            text: value.get("message").map(message_text).unwrap_or_default(),
            session_id,
        },

        Some("result") => {
            let subtype_is_error = obj
                .get("subtype")
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with("error"));
            Envelope::TerminalResult {
                text: obj
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: obj.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                    || subtype_is_error,
                session_id,
            }
        }

        Some("error") => {
            let message = obj
                .get("error")
                .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
                .or_else(|| obj.get("message").and_then(Value::as_str))
                .unwrap_or("unknown error")
                .to_string();
            Envelope::AgentError { message }
        }

        // Untyped or unfamiliar: fall back to the legacy `result` / `output`
        // fields before giving up.
        other => match ["result", "output"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
        {
            Some(text) => Envelope::LegacyOutput {
                text: text.to_string(),
                session_id,
            },
            None => Envelope::Unknown {
                kind: other.map(str::to_string),
            },
        },
    }
}

/// `--output-format json --verbose` prints the whole run as one array. Only
/// its last result is kept, tagged with the first reported session.
fn classify_transcript(items: &[Value]) -> Envelope {
    let envelopes: Vec<Envelope> = items.iter().map(classify).collect();
    let reported = envelopes
        .iter()
        .find_map(Envelope::session_id)
        .map(str::to_string);

    let Some(last) = envelopes.into_iter().rev().find(|envelope| {
        matches!(
            envelope,
            Envelope::TerminalResult { .. } | Envelope::LegacyOutput { .. }
        )
    }) else {
        return match reported {
            Some(session_id) => Envelope::System {
                session_id: Some(session_id),
            },
            None => Envelope::Unknown { kind: None },
        };
    };

    match last {
        Envelope::TerminalResult {
            text,
            is_error,
            session_id,
        } => Envelope::TerminalResult {
            text,
            is_error,
            session_id: session_id.or(reported),
        },
        Envelope::LegacyOutput { text, session_id } => Envelope::LegacyOutput {
            text,
            session_id: session_id.or(reported),
        },
        other => other,
    }
}

/// Extract `delta.text` from a `content_block_delta` carrying a `text_delta`.
fn text_delta(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    delta.get("text").and_then(Value::as_str).map(str::to_string)
}

/// Concatenate the text blocks of an assistant message.
///
/// `content` is either a plain string or an array of typed blocks; non-text
/// blocks (tool calls, thinking) are skipped.
fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}
