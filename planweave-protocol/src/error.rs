//! Protocol-level error types.

use thiserror::Error;

/// A record that could not be interpreted.
///
/// Carries the raw text so callers can log it for diagnosis. The stream
/// contract is that a parse failure never aborts the stream; the record is
/// skipped and the next one is attempted.
#[derive(Debug, Clone, Error)]
#[error("unparseable record: {reason}")]
pub struct ParseFailure {
    /// The raw record text as it arrived off the wire.
    pub raw: String,
    /// Human-readable description of what went wrong.
    pub reason: String,
}

impl ParseFailure {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while routing or applying a patch operation.
#[derive(Debug, Clone, Error)]
pub enum PatchError {
    /// The patch path does not name a known plan section.
    #[error("patch path does not name a known section: {path}")]
    UnknownPath { path: String },
}
