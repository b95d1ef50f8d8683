//! Token streaming support.
//!
//! Backends deliver completions as a channel-backed [`TokenStream`].
//! The stream accumulates everything it yields, so after it is drained
//! the full assistant message is available without a second pass.

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::backend::traits::FinishReason;

/// A chunk of streamed completion text.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    /// Whether this is the final chunk
    pub is_final: bool,
    /// Finish reason (only on a clean final chunk)
    pub finish_reason: Option<FinishReason>,
    /// Transport failure (only on a failed final chunk)
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
            finish_reason: None,
            error: None,
        }
    }

    pub fn final_chunk(content: impl Into<String>, reason: FinishReason) -> Self {
        Self {
            content: content.into(),
            is_final: true,
            finish_reason: Some(reason),
            error: None,
        }
    }

    /// Terminal chunk for a stream that died in transit.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            is_final: true,
            finish_reason: None,
            error: Some(reason.into()),
        }
    }
}

pin_project! {
    /// Stream of completion text chunks.
    pub struct TokenStream {
        #[pin]
        receiver: mpsc::Receiver<StreamChunk>,
        // Everything yielded so far, in order
        accumulated: String,
        complete: bool,
        finish_reason: Option<FinishReason>,
        failure: Option<String>,
    }
}

impl TokenStream {
    pub fn new(receiver: mpsc::Receiver<StreamChunk>) -> Self {
        Self {
            receiver,
            accumulated: String::new(),
            complete: false,
            finish_reason: None,
            failure: None,
        }
    }

    /// Wrap an already-complete response as a one-chunk stream, for
    /// backends without true streaming.
    pub fn from_text(content: impl Into<String>, reason: FinishReason) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let chunk = StreamChunk::final_chunk(content, reason);
        // The buffer has room for it, so this cannot fail.
        let _ = tx.try_send(chunk);
        Self::new(rx)
    }

    /// Create a sender/receiver pair for streaming.
    pub fn channel(buffer: usize) -> (TokenStreamSender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (TokenStreamSender { sender: tx }, Self::new(rx))
    }

    /// Text yielded so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Why generation stopped, once the final chunk has been yielded.
    /// `None` after the stream ends means it did not end cleanly.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Transport failure reported by the sender, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Drain the stream and return the full text with its finish reason.
    pub async fn collect_text(mut self) -> (String, FinishReason) {
        use futures::StreamExt;
        while self.next().await.is_some() {}
        let reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        (self.accumulated, reason)
    }
}

impl Stream for TokenStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.receiver.get_mut().poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.accumulated.push_str(&chunk.content);
                if chunk.is_final {
                    *this.complete = true;
                    *this.finish_reason = chunk.finish_reason;
                    *this.failure = chunk.error.clone();
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                *this.complete = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sender half for a token stream.
pub struct TokenStreamSender {
    sender: mpsc::Sender<StreamChunk>,
}

impl TokenStreamSender {
    /// Send a content chunk.
    pub async fn send(&self, content: impl Into<String>) -> Result<(), StreamError> {
        self.sender
            .send(StreamChunk::content(content))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Send the final chunk.
    pub async fn finish(self, reason: FinishReason) -> Result<(), StreamError> {
        self.sender
            .send(StreamChunk::final_chunk("", reason))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Report a transport failure and end the stream.
    pub async fn fail(self, reason: impl Into<String>) -> Result<(), StreamError> {
        self.sender
            .send(StreamChunk::failed(reason))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Close without a final chunk.
    pub fn abort(self) {
        drop(self.sender);
    }
}

/// Error during streaming.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Receiver was dropped
    #[error("stream closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn accumulates_chunks_in_order() {
        let (sender, mut stream) = TokenStream::channel(8);

        tokio::spawn(async move {
            sender.send("{\"type\":\"comment\",").await.unwrap();
            sender.send("\"value\":\"CHAT_START\"}").await.unwrap();
            sender.finish(FinishReason::Stop).await.unwrap();
        });

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_final);
        assert_eq!(
            stream.accumulated(),
            "{\"type\":\"comment\",\"value\":\"CHAT_START\"}"
        );
        assert!(stream.is_complete());
        assert_eq!(stream.finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn from_text_yields_a_single_final_chunk() {
        let stream = TokenStream::from_text("complete response", FinishReason::Length);
        let (text, reason) = stream.collect_text().await;
        assert_eq!(text, "complete response");
        assert_eq!(reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn abort_ends_the_stream_without_a_final_chunk() {
        let (sender, mut stream) = TokenStream::channel(8);
        sender.send("partial").await.unwrap();
        sender.abort();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(stream.finish_reason().is_none());
    }

    #[tokio::test]
    async fn fail_carries_the_reason_to_the_receiver() {
        let (sender, mut stream) = TokenStream::channel(8);
        sender.send("partial").await.unwrap();
        sender.fail("connection reset by peer").await.unwrap();

        while stream.next().await.is_some() {}
        assert!(stream.is_complete());
        assert_eq!(stream.failure(), Some("connection reset by peer"));
        assert!(stream.finish_reason().is_none());
        assert_eq!(stream.accumulated(), "partial");
    }
}
