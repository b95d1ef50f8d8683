//! Error taxonomy for sessions.
//!
//! Two families matter to callers: errors that abort the turn (timeouts,
//! transport failures, plugin failures, bans) and conditions the session
//! absorbs while continuing (skipped records, rejected patches). Only
//! the former appear here; the latter are counted and logged.

use thiserror::Error;

use crate::backend::traits::BackendError;
use crate::document::DocumentError;
use crate::plugins::PluginError;
use planweave_safety::SafetyError;

/// User-facing message for a blocked input. Never includes the stage
/// that detected the threat; that stays in the logs.
pub const THREAT_USER_MESSAGE: &str =
    "I wasn't able to process your request because a potentially malicious input was detected.";

#[derive(Debug, Error)]
pub enum AgentError {
    /// The input gate confirmed a threat. The display text never names
    /// `stage`; that field is for logs and audits only.
    #[error("I wasn't able to process your request because a potentially malicious input was detected.")]
    ThreatDetected { stage: String },

    /// The input gate could not run; distinct from a detection.
    #[error("threat screening unavailable: {0}")]
    DetectorUnavailable(String),

    /// The account is over the violation threshold.
    #[error("account is locked")]
    Banned { user_id: String },

    /// The stream exceeded the wall-clock budget for the turn.
    #[error("generation stream timed out")]
    StreamTimeout,

    /// The stream failed mid-turn.
    #[error("generation stream failed: {0}")]
    StreamTransport(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("moderation failed: {0}")]
    Moderation(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl From<SafetyError> for AgentError {
    fn from(err: SafetyError) -> Self {
        match err {
            SafetyError::Detector(e) => AgentError::DetectorUnavailable(e.to_string()),
            SafetyError::Moderation(e) => AgentError::Moderation(e.to_string()),
            SafetyError::Violations(e) => AgentError::Moderation(e.to_string()),
        }
    }
}
