//! Audit trail for session turns.
//!
//! Every turn is logged when it starts and updated when it settles, so
//! operators can see what each conversation did without trawling logs.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Maximum entries retained before pruning.
const MAX_AUDIT_ENTRIES: usize = 10_000;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Completed: streamed, committed and moderated.
    Success,
    /// Refused by the input gate.
    Blocked,
    /// Cancelled by the caller mid-stream.
    Cancelled,
    /// Aborted by an error or timeout.
    Failed,
}

/// An entry in the turn audit log.
#[derive(Debug, Clone)]
pub struct TurnAuditEntry {
    pub turn_id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub status: Option<TurnStatus>,
    /// Patches applied to the speculative overlay.
    pub patches_applied: usize,
    /// Records skipped as unparseable.
    pub parse_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Bounded in-memory audit log (newest first).
pub struct TurnAuditLog {
    entries: Arc<RwLock<VecDeque<TurnAuditEntry>>>,
    max_entries: usize,
}

impl TurnAuditLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries: MAX_AUDIT_ENTRIES,
        }
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries,
        }
    }

    /// Log a started turn; returns the turn id.
    pub async fn begin_turn(
        &self,
        conversation_id: impl Into<String>,
        user_id: Option<String>,
    ) -> String {
        let entry = TurnAuditEntry {
            turn_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            user_id,
            status: None,
            patches_applied: 0,
            parse_failures: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        };
        let turn_id = entry.turn_id.clone();

        let mut entries = self.entries.write().await;
        entries.push_front(entry);
        while entries.len() > self.max_entries {
            entries.pop_back();
        }
        turn_id
    }

    /// Settle a turn with its outcome.
    pub async fn complete_turn(
        &self,
        turn_id: &str,
        status: TurnStatus,
        patches_applied: usize,
        parse_failures: usize,
    ) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.turn_id == turn_id) {
            let now = Utc::now();
            entry.status = Some(status);
            entry.patches_applied = patches_applied;
            entry.parse_failures = parse_failures;
            entry.finished_at = Some(now);
            entry.duration_ms = Some((now - entry.started_at).num_milliseconds().max(0) as u64);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<TurnAuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(limit).cloned().collect()
    }

    pub async fn get(&self, turn_id: &str) -> Option<TurnAuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.turn_id == turn_id).cloned()
    }

    pub async fn for_conversation(&self, conversation_id: &str) -> Vec<TurnAuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> TurnAuditStats {
        let entries = self.entries.read().await;
        let total = entries.len();
        let count = |status| entries.iter().filter(|e| e.status == Some(status)).count();
        TurnAuditStats {
            total_turns: total,
            succeeded: count(TurnStatus::Success),
            blocked: count(TurnStatus::Blocked),
            cancelled: count(TurnStatus::Cancelled),
            failed: count(TurnStatus::Failed),
        }
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for TurnAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate counts from the audit log.
#[derive(Debug, Clone)]
pub struct TurnAuditStats {
    pub total_turns: usize,
    pub succeeded: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub failed: usize,
}
