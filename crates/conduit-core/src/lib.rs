//! Process orchestration and streaming protocol adapter for agent CLIs.
//!
//! Launches an agent CLI as a child process, frames and decodes its
//! line-oriented JSON output, and republishes it as a small, fixed set of
//! canonical events ([`events::CanonicalEvent`]).
//!
//! ```text
//! Orchestrator::invoke(request)
//!     |
//!     v
//! Supervisor::spawn ---> child stdout --> LineFramer --> envelope::parse
//!     |                                                      |
//!     |                                                      v
//!     |                                              Dialect::translate
//!     |                                                      |
//!     |                       SessionReconciler <--- Signal -+-> CompletionGuard
//!     |                                                      |
//!     +--- ProcessRegistry (cancel / rekey)                  v
//!                                                      EventSink
//! ```

pub mod completion;
pub mod error;
pub mod events;
pub mod framing;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use error::{ParseFailure, SupervisorError};
pub use events::{CanonicalEvent, EventSink, InvocationMode, InvocationRequest, OutboundEvent};
pub use orchestrator::{InvocationHandle, InvocationOutcome, Orchestrator, OrchestratorConfig};
pub use supervisor::{EntryId, Supervisor, SupervisorConfig};
