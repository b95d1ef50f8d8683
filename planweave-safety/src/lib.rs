//! Safety gating for plan co-authoring sessions.
//!
//! Two independent gates guard a session. Input gating runs a staged
//! chain of threat detectors over the conversation before any tokens are
//! generated. Output moderation scores each completed turn against a
//! category rubric and records a violation when the toxic band is hit.
//! Both gates feed the violation ledger, which bans an account once its
//! recent violation count crosses a threshold and un-bans it when a
//! human review invalidates enough of them.

pub mod chain;
pub mod detector;
pub mod moderation;
pub mod pipeline;
pub mod violations;

pub use chain::{
    ChainConfig, ChainConfigError, ChainOutcome, ChainRun, DetectorChain, DetectorStage,
    RunCondition, StageResult,
};
pub use detector::{
    BreakdownItem, ChatRole, ChatTurn, Detection, DetectorError, GuardDetector, MockDetector,
    MockVerdict, ThreatDetector,
};
pub use moderation::{
    CategoryCode, LlmModerator, MockModerator, ModerationError, ModerationLedger,
    ModerationRecord, ModerationVerdict, Moderator, ToxicityPolicy,
};
pub use pipeline::{InputGateOutcome, ModerationOutcome, SafetyError, SafetyPipeline};
pub use violations::{
    DetectionSource, InMemoryViolationStore, RecordedViolation, SafetyViolation, SafetyViolations,
    SafetyViolationsConfig, StoreError, ViolationError, ViolationRecordType, ViolationStore,
};
