//! Threat detector trait and implementations.
//!
//! A detector answers one question: does this conversation contain an
//! attempt to subvert the assistant (prompt injection, jailbreaks,
//! exfiltration attempts)? The hosted implementation calls a guard API
//! project; each chain stage addresses a differently tuned project via
//! its project id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// A conversation turn as submitted for screening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A detector verdict with the per-detector breakdown reported by the
/// guard service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Detection {
    pub flagged: bool,
    #[serde(default)]
    pub breakdown: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakdownItem {
    #[serde(default)]
    pub detector_type: String,
    #[serde(default)]
    pub detected: bool,
}

/// Detector failures. Unavailability is kept distinct from a positive
/// verdict so callers never treat an outage as a detection.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("threat detector unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("threat detector returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ThreatDetector: Send + Sync {
    /// Screen the conversation against the given guard project.
    async fn detect(
        &self,
        project_id: &str,
        messages: &[ChatTurn],
    ) -> Result<Detection, DetectorError>;
}

#[derive(Serialize)]
struct GuardRequest<'a> {
    messages: &'a [ChatTurn],
    project_id: &'a str,
    breakdown: bool,
}

/// Hosted guard API client.
pub struct GuardDetector {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GuardDetector {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ThreatDetector for GuardDetector {
    async fn detect(
        &self,
        project_id: &str,
        messages: &[ChatTurn],
    ) -> Result<Detection, DetectorError> {
        let request = GuardRequest {
            messages,
            project_id,
            breakdown: true,
        };

        let response = self
            .client
            .post(format!("{}/v2/guard", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DetectorError::Unavailable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Unavailable {
                reason: format!("guard API returned {status}: {body}"),
            });
        }

        let detection: Detection = response
            .json()
            .await
            .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            project_id,
            flagged = detection.flagged,
            breakdown_len = detection.breakdown.len(),
            "guard screening complete"
        );
        Ok(detection)
    }
}

/// Scripted behaviour for one mock project id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockVerdict {
    Clean,
    Flagged,
    Unavailable,
}

/// In-memory detector for tests and offline development. Verdicts are
/// keyed by project id; every call is recorded so tests can assert which
/// stages ran and in what order.
#[derive(Default)]
pub struct MockDetector {
    verdicts: HashMap<String, MockVerdict>,
    calls: Mutex<Vec<String>>,
}

impl MockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verdict(mut self, project_id: impl Into<String>, verdict: MockVerdict) -> Self {
        self.verdicts.insert(project_id.into(), verdict);
        self
    }

    /// Project ids screened so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ThreatDetector for MockDetector {
    async fn detect(
        &self,
        project_id: &str,
        _messages: &[ChatTurn],
    ) -> Result<Detection, DetectorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(project_id.to_string());
        }
        match self.verdicts.get(project_id).copied() {
            Some(MockVerdict::Flagged) => Ok(Detection {
                flagged: true,
                breakdown: Vec::new(),
            }),
            Some(MockVerdict::Unavailable) => Err(DetectorError::Unavailable {
                reason: "mock outage".into(),
            }),
            _ => Ok(Detection::default()),
        }
    }
}
