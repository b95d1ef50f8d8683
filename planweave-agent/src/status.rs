//! Streaming status classification.
//!
//! Observers derive a single status for the session from the transcript
//! and the loading flag. Classification is a pure function; the tracker
//! below only remembers the previous status so transitions get logged
//! once.

use crate::backend::traits::{Message, MessageRole};
use planweave_protocol::markers;

/// What the session is doing, from an observer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    /// Not loading.
    Idle,
    /// Loading, but nothing can be said about the payload yet.
    Loading,
    /// The user's message was sent; no assistant output yet.
    RequestMade,
    /// Document patches are streaming in.
    StreamingLessonPlan,
    /// Conversational text is streaming in.
    StreamingChatResponse,
    /// The finished turn is being moderated.
    Moderating,
}

/// Classify the current status.
///
/// When markers for several phases are present in the latest assistant
/// message, the most advanced phase wins: moderating over chat text
/// over document patches over bare loading.
pub fn classify(messages: &[Message], is_loading: bool) -> StreamingStatus {
    if !is_loading {
        return StreamingStatus::Idle;
    }
    let Some(last) = messages.last() else {
        return StreamingStatus::Loading;
    };
    match last.role {
        MessageRole::User => StreamingStatus::RequestMade,
        MessageRole::Assistant => {
            let content = last.content.as_str();
            if content.contains(markers::MODERATION_START) || content.contains(markers::MODERATING)
            {
                StreamingStatus::Moderating
            } else if content.contains("\"type\":\"prompt\"") {
                StreamingStatus::StreamingChatResponse
            } else if content.contains(markers::CHAT_START) {
                StreamingStatus::StreamingLessonPlan
            } else {
                StreamingStatus::Loading
            }
        }
        MessageRole::System => StreamingStatus::Loading,
    }
}

/// Remembers the last status so changes are logged exactly once.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<StreamingStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclassify; returns the status and whether it changed.
    pub fn update(&mut self, messages: &[Message], is_loading: bool) -> (StreamingStatus, bool) {
        let status = classify(messages, is_loading);
        let changed = self.last != Some(status);
        if changed {
            tracing::debug!(?status, previous = ?self.last, "session status changed");
            self.last = Some(status);
        }
        (status, changed)
    }

    pub fn current(&self) -> Option<StreamingStatus> {
        self.last
    }
}
