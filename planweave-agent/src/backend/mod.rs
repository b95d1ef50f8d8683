//! Generation backends.

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use traits::{
    BackendError, CompletionRequest, CompletionResponse, FinishReason, GenerationBackend,
    Message, MessageRole, ModelCapabilities, Usage,
};
