//! Dialect strategies: decoded envelopes in, pipeline signals out.
//!
//! The batch (`--output-format json`) and streaming (`stream-json`) output
//! formats overlap heavily but disagree about where the final text lives.
//! Each gets a small [`Dialect`] implementation; shapes handled identically
//! by both go through [`translate_shared`].

use tracing::debug;

use super::envelope::Envelope;
use crate::events::InvocationMode;

/// What the pipeline should do in response to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The process reported its own session identifier.
    SessionReported(String),
    /// Assistant text to publish as a `response-delta`.
    Delta(String),
    /// A terminal envelope was observed; the invocation succeeded.
    Finished,
    /// Text for the diagnostic accumulator; never published directly.
    Diagnostic(String),
}

/// Translates envelopes of one output dialect.
pub trait Dialect: Send {
    fn name(&self) -> &'static str;

    /// Map one envelope to zero or more signals, in emission order.
    fn translate(&mut self, envelope: Envelope) -> Vec<Signal>;

    /// Every piece of text published so far, concatenated.
    fn transcript(&self) -> &str;
}

/// Pick the dialect strategy for an invocation mode.
pub fn for_mode(mode: InvocationMode) -> Box<dyn Dialect> {
    match mode {
        InvocationMode::Batch => Box::new(BatchDialect::default()),
        InvocationMode::Streaming => Box::new(StreamDialect::default()),
    }
}

/// Handle the shapes both dialects treat the same way.
///
/// Pushes any session report first so that identity confirmation precedes
/// the text it arrived with. Returns the envelope when the dialect still has
/// to decide what it means.
fn translate_shared(envelope: Envelope, signals: &mut Vec<Signal>) -> Option<Envelope> {
    if let Some(id) = envelope.session_id() {
        signals.push(Signal::SessionReported(id.to_string()));
    }

    match envelope {
        Envelope::System { .. } => None,
        Envelope::AgentError { message } => {
            signals.push(Signal::Diagnostic(message));
            None
        }
        Envelope::TerminalResult {
            text,
            is_error: true,
            ..
        } => {
            if !text.is_empty() {
                signals.push(Signal::Diagnostic(text));
            }
            None
        }
        Envelope::Unknown { kind } => {
            debug!(
                kind = kind.as_deref().unwrap_or("<untyped>"),
                "dropping unrecognised envelope"
            );
            None
        }
        other => Some(other),
    }
}

fn push_delta(signals: &mut Vec<Signal>, transcript: &mut String, text: String) {
    if text.is_empty() {
        return;
    }
    transcript.push_str(&text);
    signals.push(Signal::Delta(text));
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One-shot JSON output: every text-bearing envelope is published verbatim.
#[derive(Debug, Default)]
pub struct BatchDialect {
    transcript: String,
}

impl Dialect for BatchDialect {
    fn name(&self) -> &'static str {
        "batch-json"
    }

    fn translate(&mut self, envelope: Envelope) -> Vec<Signal> {
        let mut signals = Vec::new();
        let Some(envelope) = translate_shared(envelope, &mut signals) else {
            return signals;
        };

        match envelope {
            Envelope::TextDelta { text } | Envelope::AssistantMessage { text, .. } => {
                push_delta(&mut signals, &mut self.transcript, text);
            }
            Envelope::TerminalResult { text, .. } | Envelope::LegacyOutput { text, .. } => {
                push_delta(&mut signals, &mut self.transcript, text);
                signals.push(Signal::Finished);
            }
            Envelope::System { .. } | Envelope::AgentError { .. } | Envelope::Unknown { .. } => {}
        }
        signals
    }

    fn transcript(&self) -> &str {
        &self.transcript
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Incremental stream-json output.
///
/// With partial messages enabled the CLI sends each message twice: as deltas
/// and then as a complete `assistant` envelope, and finally repeats the last
/// message in the `result` envelope. Complete messages are only published
/// when no deltas preceded them, and a result equal to the last published
/// message is not repeated.
#[derive(Debug, Default)]
pub struct StreamDialect {
    transcript: String,
    /// Deltas published since the last complete message.
    current: String,
    /// Text of the last finished message.
    last_message: String,
}

impl StreamDialect {
    fn already_published(&self, text: &str) -> bool {
        let text = text.trim();
        !text.is_empty() && (text == self.last_message.trim() || text == self.current.trim())
    }
}

impl Dialect for StreamDialect {
    fn name(&self) -> &'static str {
        "stream-json"
    }

    fn translate(&mut self, envelope: Envelope) -> Vec<Signal> {
        let mut signals = Vec::new();
        let Some(envelope) = translate_shared(envelope, &mut signals) else {
            return signals;
        };

        match envelope {
            Envelope::TextDelta { text } => {
                self.current.push_str(&text);
                push_delta(&mut signals, &mut self.transcript, text);
            }
            Envelope::AssistantMessage { text, .. } => {
                let streamed = std::mem::take(&mut self.current);
                if streamed.is_empty() {
                    push_delta(&mut signals, &mut self.transcript, text.clone());
                    self.last_message = text;
                } else {
                    debug!("complete message already streamed as deltas");
                    self.last_message = if text.is_empty() { streamed } else { text };
                }
            }
            Envelope::TerminalResult { text, .. } | Envelope::LegacyOutput { text, .. } => {
                if self.already_published(&text) {
                    debug!("result repeats streamed text; not re-emitting");
                } else {
                    push_delta(&mut signals, &mut self.transcript, text);
                }
                signals.push(Signal::Finished);
            }
            Envelope::System { .. } | Envelope::AgentError { .. } | Envelope::Unknown { .. } => {}
        }
        signals
    }

    fn transcript(&self) -> &str {
        &self.transcript
    }
}
