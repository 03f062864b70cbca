//! Agent CLI output protocol: envelope decoding and dialect translation.
//!
//! ```text
//! framed line --parse--> Envelope --Dialect::translate--> Vec<Signal>
//! ```
//!
//! Malformed lines and unrecognised envelopes never stop the stream; they
//! are logged and skipped.

pub mod dialect;
pub mod envelope;

pub use dialect::{BatchDialect, Dialect, Signal, StreamDialect};
pub use envelope::{Envelope, parse};
