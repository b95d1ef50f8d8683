//! The safety violation ledger.
//!
//! Both gates write here. An account is banned when its undeleted
//! violations inside a rolling window reach a threshold; ban state is
//! evaluated lazily from the current count at access-check time, so
//! invalidating a violation un-bans the account on the very next check
//! without any separate un-ban bookkeeping. Lifting a ban never deletes
//! the remaining violations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which gate detected the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionSource {
    Moderation,
    ThreatDetection,
}

/// What kind of record the violation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationRecordType {
    Moderation,
    ChatSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub id: String,
    pub user_id: String,
    pub source: DetectionSource,
    pub record_type: ViolationRecordType,
    /// Id of the moderation record or conversation that produced this
    /// violation. Invalidation deletes by this id.
    pub record_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("violation store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for violations.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn create(&self, violation: SafetyViolation) -> Result<(), StoreError>;

    /// Undeleted violations for a user created at or after `since`.
    async fn count_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<usize, StoreError>;

    /// All undeleted violations for a user, newest first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SafetyViolation>, StoreError>;

    /// Delete every violation referencing `record_id`; returns the
    /// deleted rows so callers can re-evaluate the affected users.
    async fn delete_by_record_id(
        &self,
        record_id: &str,
    ) -> Result<Vec<SafetyViolation>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryViolationStore {
    entries: DashMap<String, SafetyViolation>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ViolationStore for InMemoryViolationStore {
    async fn create(&self, violation: SafetyViolation) -> Result<(), StoreError> {
        self.entries.insert(violation.id.clone(), violation);
        Ok(())
    }

    async fn count_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.created_at >= since)
            .count())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SafetyViolation>, StoreError> {
        let mut out: Vec<SafetyViolation> = self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn delete_by_record_id(
        &self,
        record_id: &str,
    ) -> Result<Vec<SafetyViolation>, StoreError> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.record_id == record_id)
            .map(|e| e.id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in ids {
            if let Some((_, violation)) = self.entries.remove(&id) {
                removed.push(violation);
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolationsConfig {
    /// Undeleted recent violations at which the account is banned.
    pub ban_threshold: usize,
    /// Rolling window over which violations count.
    pub window_days: i64,
}

impl Default for SafetyViolationsConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 5,
            window_days: 30,
        }
    }
}

/// Outcome of recording one violation.
#[derive(Debug, Clone)]
pub struct RecordedViolation {
    pub violation: SafetyViolation,
    /// Whether this violation pushed the account over the ban threshold.
    pub banned: bool,
}

#[derive(Debug, Error)]
pub enum ViolationError {
    #[error("user account is locked")]
    UserBanned { user_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ban policy over a violation store.
pub struct SafetyViolations {
    store: std::sync::Arc<dyn ViolationStore>,
    config: SafetyViolationsConfig,
}

impl SafetyViolations {
    pub fn new(store: std::sync::Arc<dyn ViolationStore>) -> Self {
        Self {
            store,
            config: SafetyViolationsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SafetyViolationsConfig) -> Self {
        self.config = config;
        self
    }

    fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.config.window_days)
    }

    /// Record one violation and report whether it banned the account.
    pub async fn record_violation(
        &self,
        user_id: &str,
        source: DetectionSource,
        record_type: ViolationRecordType,
        record_id: &str,
    ) -> RecordedViolation {
        let violation = SafetyViolation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            source,
            record_type,
            record_id: record_id.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.create(violation.clone()).await {
            tracing::error!(user_id, error = %err, "failed to persist safety violation");
        }
        let banned = self.is_banned(user_id).await;
        if banned {
            tracing::warn!(user_id, "violation pushed account over the ban threshold");
        } else {
            tracing::info!(user_id, ?source, "safety violation recorded");
        }
        RecordedViolation { violation, banned }
    }

    /// Lazily evaluated ban state: banned iff the undeleted violations
    /// inside the rolling window have reached the threshold.
    pub async fn is_banned(&self, user_id: &str) -> bool {
        match self.store.count_since(user_id, self.window_start()).await {
            Ok(count) => count >= self.config.ban_threshold,
            Err(err) => {
                // A store outage reads as not banned.
                tracing::error!(user_id, error = %err, "violation count unavailable");
                false
            }
        }
    }

    /// Review surface: a user's undeleted violations, newest first.
    pub async fn violations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SafetyViolation>, ViolationError> {
        Ok(self.store.list_by_user(user_id).await?)
    }

    /// Access check for the start of a turn.
    pub async fn check_access(&self, user_id: &str) -> Result<(), ViolationError> {
        if self.is_banned(user_id).await {
            Err(ViolationError::UserBanned {
                user_id: user_id.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Remove all violations derived from an invalidated record. The
    /// next access check for each affected user reflects the lower
    /// count; a lifted ban does not reset the violations that remain.
    pub async fn remove_violations_by_record_id(&self, record_id: &str) -> Vec<SafetyViolation> {
        match self.store.delete_by_record_id(record_id).await {
            Ok(removed) => {
                for violation in &removed {
                    tracing::info!(
                        user_id = %violation.user_id,
                        record_id,
                        "safety violation removed after review"
                    );
                }
                removed
            }
            Err(err) => {
                tracing::error!(record_id, error = %err, "failed to remove violations");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ledger(threshold: usize) -> SafetyViolations {
        SafetyViolations::new(Arc::new(InMemoryViolationStore::new())).with_config(
            SafetyViolationsConfig {
                ban_threshold: threshold,
                window_days: 30,
            },
        )
    }

    async fn record_n(ledger: &SafetyViolations, user: &str, n: usize, record_id: &str) {
        for _ in 0..n {
            ledger
                .record_violation(
                    user,
                    DetectionSource::Moderation,
                    ViolationRecordType::Moderation,
                    record_id,
                )
                .await;
        }
    }

    #[tokio::test]
    async fn ban_fires_exactly_at_the_threshold() {
        let ledger = ledger(3);
        record_n(&ledger, "user-1", 2, "rec-a").await;
        assert!(ledger.check_access("user-1").await.is_ok());

        let recorded = ledger
            .record_violation(
                "user-1",
                DetectionSource::ThreatDetection,
                ViolationRecordType::ChatSession,
                "conv-9",
            )
            .await;
        assert!(recorded.banned);
        assert!(matches!(
            ledger.check_access("user-1").await,
            Err(ViolationError::UserBanned { user_id }) if user_id == "user-1"
        ));
    }

    #[tokio::test]
    async fn invalidation_unbans_on_the_next_check() {
        let ledger = ledger(3);
        record_n(&ledger, "user-1", 2, "rec-a").await;
        record_n(&ledger, "user-1", 1, "rec-b").await;
        assert!(ledger.is_banned("user-1").await);

        let removed = ledger.remove_violations_by_record_id("rec-b").await;
        assert_eq!(removed.len(), 1);
        assert!(!ledger.is_banned("user-1").await);

        // The remaining violations were not reset by the lifted ban.
        let recorded = ledger
            .record_violation(
                "user-1",
                DetectionSource::Moderation,
                ViolationRecordType::Moderation,
                "rec-c",
            )
            .await;
        assert!(recorded.banned);
    }

    #[tokio::test]
    async fn counts_are_per_user() {
        let ledger = ledger(2);
        record_n(&ledger, "user-1", 2, "rec-a").await;
        assert!(ledger.is_banned("user-1").await);
        assert!(!ledger.is_banned("user-2").await);
    }

    #[tokio::test]
    async fn listing_returns_only_the_users_violations() {
        let ledger = ledger(10);
        record_n(&ledger, "user-1", 2, "rec-a").await;
        record_n(&ledger, "user-2", 1, "rec-b").await;

        let listed = ledger.violations_for_user("user-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|v| v.user_id == "user-1"));
    }

    #[tokio::test]
    async fn removing_an_unknown_record_id_is_a_no_op() {
        let ledger = ledger(2);
        record_n(&ledger, "user-1", 1, "rec-a").await;
        assert!(ledger.remove_violations_by_record_id("rec-x").await.is_empty());
        assert!(!ledger.is_banned("user-1").await);
    }
}
