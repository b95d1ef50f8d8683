//! OpenAI-compatible generation backend.
//!
//! Works with any OpenAI-compatible chat-completions API. Streaming uses
//! server-sent events; each `data:` line carries one delta.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};

use super::traits::*;
use crate::config::BackendConfig;
use crate::stream::TokenStream;

/// OpenAI-compatible backend.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    capabilities: ModelCapabilities,
    default_max_tokens: Option<u32>,
    default_temperature: Option<f32>,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            capabilities: ModelCapabilities {
                context_window: 128_000,
                max_output_tokens: 16_384,
                supports_streaming: true,
            },
            default_max_tokens: None,
            default_temperature: None,
        }
    }

    /// Backend from deployment config. The configured generation limits
    /// apply to requests that do not set their own.
    pub fn from_config(config: &BackendConfig, api_key: Option<String>) -> Self {
        let mut backend = Self::new(config.base_url.clone(), config.model.clone(), api_key);
        backend.default_max_tokens = Some(config.max_tokens);
        backend.default_temperature = Some(config.temperature);
        backend
    }

    /// Backend for the hosted OpenAI API.
    pub fn openai(model: &str, api_key: impl Into<String>) -> Self {
        Self::new("https://api.openai.com/v1", model, Some(api_key.into()))
    }

    /// Backend pointing at a local Ollama server.
    pub fn ollama(model: &str) -> Self {
        Self::new("http://localhost:11434/v1", model, None)
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn auth_header(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {k}"))
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for msg in &request.messages {
            messages.push(ChatMessage {
                role: match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                }
                .to_string(),
                content: msg.content.clone(),
            });
        }
        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.or(self.default_max_tokens),
            temperature: request.temperature.or(self.default_temperature),
            stop: request.stop_sequences.clone(),
            stream,
        }
    }

    async fn send(&self, chat_request: &ChatRequest) -> Result<reqwest::Response, BackendError> {
        let mut http_request = self.client.post(self.chat_completions_url());
        if let Some(auth) = self.auth_header() {
            http_request = http_request.header(header::AUTHORIZATION, auth);
        }

        let response = http_request
            .json(chat_request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(BackendError::RateLimited {
                    retry_after_ms: None,
                });
            }
            return Err(BackendError::RequestFailed(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }
}

/// Chat completion request body.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Chat completion response body.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<UsageResponse>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// One SSE delta frame.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Parse one SSE line. Returns the `data:` payload if the line carries
/// one, or `None` for comments, blank lines and event fields.
fn sse_payload(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    line.strip_prefix("data:").map(str::trim_start)
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }
        request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        let chat_request = self.build_request(&request, false);
        let response = self.send(&chat_request).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("no choices in response".to_string()))?;

        let usage = chat_response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TokenStream, BackendError> {
        let chat_request = self.build_request(&request, true);
        let response = self.send(&chat_request).await?;

        let (sender, stream) = TokenStream::channel(64);
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            // Byte buffer: SSE lines and UTF-8 sequences can both be
            // split across network chunks.
            let mut buffer: Vec<u8> = Vec::new();
            let mut finish_reason = None;
            let mut sender = Some(sender);

            'read: while let Some(next) = body.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(error = %err, "completion stream transport failed");
                        if let Some(tx) = sender.take() {
                            let _ = tx.fail(err.to_string()).await;
                        }
                        break 'read;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
                    let Some(payload) = sse_payload(&line) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        break 'read;
                    }
                    let frame: StreamFrame = match serde_json::from_str(payload) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping malformed SSE frame");
                            continue;
                        }
                    };
                    for choice in frame.choices {
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            finish_reason = Some(map_finish_reason(Some(reason)));
                        }
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                let closed = match sender.as_ref() {
                                    Some(tx) => tx.send(content).await.is_err(),
                                    None => true,
                                };
                                if closed {
                                    // Receiver dropped, stop reading.
                                    sender = None;
                                    break 'read;
                                }
                            }
                        }
                    }
                }
            }

            if let Some(tx) = sender.take() {
                let _ = tx.finish(finish_reason.unwrap_or(FinishReason::Stop)).await;
            }
        });

        Ok(stream)
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }
}
