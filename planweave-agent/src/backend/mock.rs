//! Mock generation backend for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::traits::*;
use crate::stream::TokenStream;

/// Mock backend with a scripted response.
///
/// The response is delivered through the streaming path in fixed-size
/// character chunks, so record-boundary handling gets exercised the same
/// way a real provider would exercise it.
pub struct MockBackend {
    model_id: String,
    available: AtomicBool,
    capabilities: ModelCapabilities,
    response_content: String,
    chunk_chars: usize,
    call_count: AtomicU32,
}

impl MockBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            available: AtomicBool::new(true),
            capabilities: ModelCapabilities {
                supports_streaming: true,
                ..ModelCapabilities::default()
            },
            response_content: String::new(),
            chunk_chars: 7,
            call_count: AtomicU32::new(0),
        }
    }

    /// Set the scripted response text.
    pub fn with_response(mut self, content: impl Into<String>) -> Self {
        self.response_content = content.into();
        self
    }

    /// Set how many characters each streamed chunk carries.
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// How many times a completion was requested.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn id(&self) -> &str {
        &self.model_id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock backend disabled".to_string()));
        }

        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| m.content.len() as u32 / 4)
            .sum();

        Ok(CompletionResponse {
            content: self.response_content.clone(),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens,
                completion_tokens: self.response_content.len() as u32 / 4,
            },
        })
    }

    async fn stream(&self, _request: CompletionRequest) -> Result<TokenStream, BackendError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock backend disabled".to_string()));
        }

        let content = self.response_content.clone();
        let chunk_chars = self.chunk_chars;
        let (sender, stream) = TokenStream::channel(16);

        tokio::spawn(async move {
            let chars: Vec<char> = content.chars().collect();
            for piece in chars.chunks(chunk_chars) {
                let chunk: String = piece.iter().collect();
                if sender.send(chunk).await.is_err() {
                    return;
                }
            }
            let _ = sender.finish(FinishReason::Stop).await;
        });

        Ok(stream)
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }
}
