//! Output moderation.
//!
//! Every completed turn's document is scored against a category rubric.
//! Scores use a 1..=5 scale where LOWER means more severe; 5 is fully
//! compliant. A verdict is toxic when any category in the configured
//! toxic groups scores inside the severe band, at which point the caller
//! records a safety violation against the account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::violations::{DetectionSource, SafetyViolations, ViolationRecordType};

/// A moderation category code, e.g. `l/strong-language` or
/// `t/encouragement-illegal-activity`. The prefix before the slash is
/// the category group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryCode(pub String);

impl CategoryCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The group prefix, e.g. `t` for `t/encouragement-harmful-behaviour`.
    pub fn group(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for CategoryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the scorer produced for one piece of content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModerationVerdict {
    /// Categories the scorer considered relevant.
    #[serde(default)]
    pub categories: Vec<CategoryCode>,
    /// Likert score per category, 1 (most severe) to 5 (compliant).
    #[serde(default)]
    pub scores: BTreeMap<CategoryCode, u8>,
    #[serde(default)]
    pub justification: String,
}

impl ModerationVerdict {
    /// A fully compliant verdict.
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn is_toxic(&self, policy: &ToxicityPolicy) -> bool {
        policy.is_toxic(self)
    }
}

/// Which category groups count as toxic and at what score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToxicityPolicy {
    /// Category group prefixes whose severe scores are toxic.
    pub toxic_groups: Vec<String>,
    /// Scores at or below this value are in the severe band.
    pub max_acceptable_score: u8,
}

impl Default for ToxicityPolicy {
    fn default() -> Self {
        Self {
            toxic_groups: vec!["t".to_string()],
            max_acceptable_score: 4,
        }
    }
}

impl ToxicityPolicy {
    /// Toxic iff at least one scored category belongs to a toxic group
    /// and its score falls in the severe band. Categories without a
    /// score never contribute.
    pub fn is_toxic(&self, verdict: &ModerationVerdict) -> bool {
        verdict.scores.iter().any(|(code, score)| {
            *score <= self.max_acceptable_score
                && self.toxic_groups.iter().any(|g| code.group() == g)
        })
    }
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderator unavailable: {0}")]
    Unavailable(String),

    #[error("moderator returned an unusable verdict after {attempts} attempts: {reason}")]
    InvalidVerdict { attempts: u32, reason: String },

    #[error("moderation record not found: {0}")]
    RecordNotFound(String),
}

#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(&self, content: &str) -> Result<ModerationVerdict, ModerationError>;
}

const SCORING_INSTRUCTIONS: &str = "You are a content scorer for teaching material. Score the \
document against each category group on a 1-5 scale where 1 means a severe violation and 5 means \
fully compliant. Respond with a JSON object of the form \
{\"categories\": [\"<code>\"], \"scores\": {\"<code>\": <1-5>}, \"justification\": \"...\"} \
listing only categories scoring below 5.";

#[derive(Serialize)]
struct ScorerRequest<'a> {
    model: &'a str,
    messages: Vec<ScorerMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ScorerMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'a str,
}

#[derive(Deserialize)]
struct ScorerResponse {
    choices: Vec<ScorerChoice>,
}

#[derive(Deserialize)]
struct ScorerChoice {
    message: ScorerResponseMessage,
}

#[derive(Deserialize)]
struct ScorerResponseMessage {
    content: String,
}

/// Moderator backed by a chat-completions endpoint in JSON mode.
///
/// Model output occasionally fails the verdict schema, so parsing is
/// retried with a fresh completion up to `max_attempts` times before
/// giving up.
pub struct LlmModerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_attempts: u32,
}

impl LlmModerator {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            max_attempts: 3,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn score_once(&self, content: &str) -> Result<String, ModerationError> {
        let request = ScorerRequest {
            model: &self.model,
            messages: vec![
                ScorerMessage {
                    role: "system",
                    content: SCORING_INSTRUCTIONS,
                },
                ScorerMessage {
                    role: "user",
                    content,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModerationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Unavailable(format!(
                "scorer returned {status}: {body}"
            )));
        }

        let parsed: ScorerResponse = response
            .json()
            .await
            .map_err(|e| ModerationError::Unavailable(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModerationError::Unavailable("scorer returned no choices".into()))
    }
}

#[async_trait]
impl Moderator for LlmModerator {
    async fn moderate(&self, content: &str) -> Result<ModerationVerdict, ModerationError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            let raw = self.score_once(content).await?;
            match serde_json::from_str::<ModerationVerdict>(&raw) {
                Ok(verdict) => return Ok(verdict),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "scorer verdict failed schema; retrying");
                    last_reason = err.to_string();
                }
            }
        }
        Err(ModerationError::InvalidVerdict {
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }
}

/// Fixed-verdict moderator for tests.
#[derive(Default)]
pub struct MockModerator {
    verdict: ModerationVerdict,
    unavailable: bool,
}

impl MockModerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verdict(mut self, verdict: ModerationVerdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Moderator for MockModerator {
    async fn moderate(&self, _content: &str) -> Result<ModerationVerdict, ModerationError> {
        if self.unavailable {
            return Err(ModerationError::Unavailable("mock outage".into()));
        }
        Ok(self.verdict.clone())
    }
}

/// A persisted moderation result for one assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub verdict: ModerationVerdict,
    pub created_at: DateTime<Utc>,
    /// Reviewer who invalidated this record, if any. Invalidated
    /// records no longer count toward anything.
    pub invalidated_by: Option<String>,
}

/// In-memory store of moderation records with atomic invalidation.
///
/// Invalidation marks the record and removes the violations derived from
/// it under one lock acquisition, so no observer sees the record
/// invalidated while its violations still count.
#[derive(Default)]
pub struct ModerationLedger {
    records: Mutex<HashMap<String, ModerationRecord>>,
}

impl ModerationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(
        &self,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        verdict: ModerationVerdict,
    ) -> ModerationRecord {
        let record = ModerationRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            verdict,
            created_at: Utc::now(),
            invalidated_by: None,
        };
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    pub async fn get(&self, id: &str) -> Option<ModerationRecord> {
        self.records.lock().await.get(id).cloned()
    }

    /// Invalidate a record after human review and remove every safety
    /// violation that referenced it. The ledger lock is held across both
    /// steps.
    pub async fn invalidate(
        &self,
        id: &str,
        reviewer_id: &str,
        violations: &SafetyViolations,
    ) -> Result<ModerationRecord, ModerationError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| ModerationError::RecordNotFound(id.to_string()))?;
        record.invalidated_by = Some(reviewer_id.to_string());
        let record = record.clone();
        violations.remove_violations_by_record_id(id).await;
        tracing::info!(moderation_id = id, reviewer_id, "moderation record invalidated");
        Ok(record)
    }

    /// Record a violation for a toxic verdict, referencing the record.
    pub async fn record_toxic_violation(
        &self,
        record: &ModerationRecord,
        violations: &SafetyViolations,
    ) -> crate::violations::RecordedViolation {
        violations
            .record_violation(
                &record.user_id,
                DetectionSource::Moderation,
                ViolationRecordType::Moderation,
                &record.id,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(pairs: &[(&str, u8)]) -> ModerationVerdict {
        ModerationVerdict {
            categories: pairs.iter().map(|(c, _)| CategoryCode::new(*c)).collect(),
            scores: pairs
                .iter()
                .map(|(c, s)| (CategoryCode::new(*c), *s))
                .collect(),
            justification: "test".into(),
        }
    }

    #[test]
    fn category_groups_come_from_the_prefix() {
        assert_eq!(CategoryCode::new("t/guns-weapons").group(), "t");
        assert_eq!(CategoryCode::new("l/strong-language").group(), "l");
        assert_eq!(CategoryCode::new("ungrouped").group(), "ungrouped");
    }

    #[test]
    fn severe_toxic_group_score_is_toxic() {
        let policy = ToxicityPolicy::default();
        assert!(policy.is_toxic(&verdict(&[("t/encouragement-harmful-behaviour", 1)])));
        assert!(policy.is_toxic(&verdict(&[("t/guns-weapons", 4)])));
    }

    #[test]
    fn compliant_or_non_toxic_groups_are_not_toxic() {
        let policy = ToxicityPolicy::default();
        // Score 5 is compliant even in a toxic group.
        assert!(!policy.is_toxic(&verdict(&[("t/guns-weapons", 5)])));
        // Severe scores outside the toxic groups moderate but do not ban.
        assert!(!policy.is_toxic(&verdict(&[("l/strong-language", 1), ("v/violence", 2)])));
        assert!(!policy.is_toxic(&ModerationVerdict::clear()));
    }

    #[test]
    fn verdict_schema_round_trips() {
        let raw = r#"{
            "categories": ["l/strong-language"],
            "scores": {"l/strong-language": 3},
            "justification": "mild swearing in the practice task"
        }"#;
        let verdict: ModerationVerdict = serde_json::from_str(raw).unwrap();
        assert_eq!(verdict.scores[&CategoryCode::new("l/strong-language")], 3);
        assert!(!ToxicityPolicy::default().is_toxic(&verdict));
    }

    #[tokio::test]
    async fn ledger_records_and_fetches() {
        let ledger = ModerationLedger::new();
        let record = ledger
            .record("user-1", "conv-1", "msg-1", ModerationVerdict::clear())
            .await;
        let fetched = ledger.get(&record.id).await.unwrap();
        assert_eq!(fetched.message_id, "msg-1");
        assert!(fetched.invalidated_by.is_none());
    }
}
