//! Exactly-once completion.
//!
//! The agent CLI signals "done" differently per dialect: a `result`
//! envelope mid-stream, a result only visible once the trailing buffer is
//! flushed, or nothing but a zero exit code. All three paths call
//! [`CompletionGuard::fire`]; only the first produces an event.

use crate::events::CanonicalEvent;

/// One-shot latch for the `completion` event of a single invocation.
#[derive(Debug, Default)]
pub struct CompletionGuard {
    fired_with: Option<i32>,
}

impl CompletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch and return the `completion` event, or `None` if already fired.
    pub fn fire(&mut self, exit_code: i32, is_new_session: bool) -> Option<CanonicalEvent> {
        if self.fired_with.is_some() {
            return None;
        }
        self.fired_with = Some(exit_code);
        Some(CanonicalEvent::Completion {
            exit_code,
            is_new_session,
        })
    }

    pub fn has_fired(&self) -> bool {
        self.fired_with.is_some()
    }

    /// Exit code the guard fired with.
    pub fn exit_code(&self) -> Option<i32> {
        self.fired_with
    }
}
