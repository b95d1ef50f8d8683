//! Streaming plan co-authoring sessions.
//!
//! A [`session::ChatSession`] owns one conversation: it gates the input
//! through the safety pipeline, streams a completion from the configured
//! backend, folds the record stream into the plan document, moderates
//! the finished turn and dispatches plugin hooks along the way.

pub mod audit;
pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod plugins;
pub mod session;
pub mod status;
pub mod stream;

pub use audit::{TurnAuditEntry, TurnAuditLog, TurnAuditStats, TurnStatus};
pub use backend::mock::MockBackend;
pub use backend::openai::OpenAiBackend;
pub use backend::traits::{
    BackendError, CompletionRequest, CompletionResponse, FinishReason, GenerationBackend,
    Message, MessageRole, ModelCapabilities, Usage,
};
pub use config::{AgentConfig, BackendConfig, SafetyConfig, SessionConfig};
pub use document::{
    CommitSummary, DocumentError, DocumentSynthesizer, ExperimentAssignment, Provenance,
    SectionState,
};
pub use error::AgentError;
pub use plugins::{Plugin, PluginContext, PluginDispatcher, PluginError};
pub use error::THREAT_USER_MESSAGE;
pub use session::{ChatSession, TurnOutcome};
pub use status::{classify, StatusTracker, StreamingStatus};
pub use stream::{StreamChunk, TokenStream, TokenStreamSender};
