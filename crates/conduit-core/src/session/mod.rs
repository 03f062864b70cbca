//! Session identity reconciliation.
//!
//! A session identity either comes from the caller (resume), is minted
//! before spawn and passed as `--session-id`, or is reported by the process
//! itself. The first process-reported identity wins and is final.

use tracing::{debug, warn};

/// Where the pre-spawn identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Supplied by the caller to continue an existing session.
    Resumed,
    /// Minted locally for a brand-new session.
    Generated,
}

/// The result of the one-time `unconfirmed -> confirmed` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Identity the process was registered under until now.
    pub previous: String,
    /// Identity reported by the process.
    pub confirmed: String,
    /// Whether a `session-created` event must be published.
    pub announce: bool,
}

/// Two-state machine: `unconfirmed` until the process reports an identity,
/// `confirmed` afterwards.
#[derive(Debug, Clone)]
pub struct SessionReconciler {
    current: String,
    origin: IdentityOrigin,
    confirmed: bool,
}

impl SessionReconciler {
    /// A new session with a locally minted identity.
    pub fn fresh(generated: impl Into<String>) -> Self {
        Self {
            current: generated.into(),
            origin: IdentityOrigin::Generated,
            confirmed: false,
        }
    }

    /// Continue a session the caller already knows about.
    pub fn resuming(prior: impl Into<String>) -> Self {
        Self {
            current: prior.into(),
            origin: IdentityOrigin::Resumed,
            confirmed: false,
        }
    }

    /// Best-known identity right now.
    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    pub fn is_resume(&self) -> bool {
        self.origin == IdentityOrigin::Resumed
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Record an identity reported by the process.
    ///
    /// Returns `Some` only for the first report. Later reports are ignored:
    /// the first process-reported identity is authoritative.
    pub fn observe(&mut self, reported: &str) -> Option<Confirmation> {
        if self.confirmed {
            if reported != self.current {
                debug!(
                    confirmed = %self.current,
                    reported,
                    "ignoring later session identity report"
                );
            }
            return None;
        }

        self.confirmed = true;
        let previous = std::mem::replace(&mut self.current, reported.to_string());
        if previous != reported {
            debug!(%previous, confirmed = reported, "process reported a different session identity");
        }

        Some(Confirmation {
            previous,
            confirmed: reported.to_string(),
            announce: self.origin == IdentityOrigin::Generated,
        })
    }

    /// The final identity for this invocation.
    ///
    /// Falls back to the pre-spawn identity when the process never reported
    /// one.
    pub fn finish(&self) -> &str {
        if !self.confirmed {
            warn!(
                session_id = %self.current,
                "agent never reported a session identity; keeping the pre-spawn identity"
            );
        }
        &self.current
    }
}
