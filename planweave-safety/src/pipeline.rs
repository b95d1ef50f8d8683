//! The safety pipeline facade.
//!
//! Sessions talk to safety through this type: input gating before
//! generation, output moderation after it, and review invalidation.
//! Recording violations and evaluating bans happen here so the chain and
//! the moderator stay pure decision-makers.

use std::sync::Arc;
use thiserror::Error;

use crate::chain::{ChainOutcome, DetectorChain};
use crate::detector::{ChatTurn, DetectorError};
use crate::moderation::{
    ModerationError, ModerationLedger, ModerationRecord, Moderator, ToxicityPolicy,
};
use crate::violations::{
    DetectionSource, SafetyViolations, ViolationError, ViolationRecordType,
};

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Moderation(#[from] ModerationError),

    #[error(transparent)]
    Violations(#[from] ViolationError),
}

/// Decision of the input gate for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputGateOutcome {
    Pass,
    /// Flagged by a non-recording stage; admitted, nothing recorded.
    FlaggedNoAction { stage: String },
    /// Confirmed threat. Exactly one violation has been recorded.
    Blocked { stage: String, banned: bool },
}

/// Result of moderating one completed turn.
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    pub record: ModerationRecord,
    pub toxic: bool,
    /// Set when a toxic verdict's violation banned the account.
    pub banned: bool,
}

pub struct SafetyPipeline {
    chain: DetectorChain,
    moderator: Arc<dyn Moderator>,
    violations: Arc<SafetyViolations>,
    ledger: Arc<ModerationLedger>,
    policy: ToxicityPolicy,
}

impl SafetyPipeline {
    pub fn new(
        chain: DetectorChain,
        moderator: Arc<dyn Moderator>,
        violations: Arc<SafetyViolations>,
    ) -> Self {
        Self {
            chain,
            moderator,
            violations,
            ledger: Arc::new(ModerationLedger::new()),
            policy: ToxicityPolicy::default(),
        }
    }

    pub fn with_toxicity_policy(mut self, policy: ToxicityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn violations(&self) -> &SafetyViolations {
        &self.violations
    }

    pub fn moderation_ledger(&self) -> &ModerationLedger {
        &self.ledger
    }

    /// Input gate: screen the conversation before any generation.
    ///
    /// A blocked verdict records exactly one violation against the
    /// conversation, regardless of how many stages flagged along the
    /// way. Detector outages propagate; they are never a verdict.
    pub async fn check_input(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[ChatTurn],
    ) -> Result<InputGateOutcome, SafetyError> {
        let run = self.chain.run(messages).await?;
        match run.outcome {
            ChainOutcome::Pass => Ok(InputGateOutcome::Pass),
            ChainOutcome::FlaggedNoAction { stage } => {
                tracing::info!(stage, conversation_id, "input flagged without action");
                Ok(InputGateOutcome::FlaggedNoAction { stage })
            }
            ChainOutcome::Blocked { stage } => {
                let recorded = self
                    .violations
                    .record_violation(
                        user_id,
                        DetectionSource::ThreatDetection,
                        ViolationRecordType::ChatSession,
                        conversation_id,
                    )
                    .await;
                Ok(InputGateOutcome::Blocked {
                    stage,
                    banned: recorded.banned,
                })
            }
        }
    }

    /// Output gate: score a completed turn's document, persist the
    /// moderation record and, when the verdict is toxic, record a
    /// violation referencing it.
    pub async fn moderate_turn(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ModerationOutcome, SafetyError> {
        let verdict = self.moderator.moderate(content).await?;
        let toxic = verdict.is_toxic(&self.policy);
        let record = self
            .ledger
            .record(user_id, conversation_id, message_id, verdict)
            .await;

        let banned = if toxic {
            tracing::warn!(
                moderation_id = %record.id,
                conversation_id,
                "toxic moderation verdict"
            );
            self.ledger
                .record_toxic_violation(&record, &self.violations)
                .await
                .banned
        } else {
            false
        };

        Ok(ModerationOutcome {
            record,
            toxic,
            banned,
        })
    }

    /// Review path: invalidate a moderation record and drop the
    /// violations derived from it.
    pub async fn invalidate_moderation(
        &self,
        moderation_id: &str,
        reviewer_id: &str,
    ) -> Result<ModerationRecord, SafetyError> {
        Ok(self
            .ledger
            .invalidate(moderation_id, reviewer_id, &self.violations)
            .await?)
    }
}
