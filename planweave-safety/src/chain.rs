//! Staged detector chain.
//!
//! Detection cost and precision are traded off by running a cheap
//! always-on screening stage first and escalating to confirmation stages
//! only when needed. Each stage carries a run condition evaluated against
//! the outcome of the previous stage that actually executed, and a flag
//! saying whether a positive verdict from it records a policy violation.

use std::sync::Arc;
use thiserror::Error;

use crate::detector::{ChatTurn, DetectorError, ThreatDetector};

/// When a stage runs, relative to the last executed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCondition {
    /// Entry stage; runs unconditionally.
    Always,
    /// Runs only to confirm a positive from the previous executed stage.
    OnPreviousPositive,
    /// Runs only to double-check a negative from the previous executed stage.
    OnPreviousNegative,
}

/// One stage of the chain.
#[derive(Debug, Clone)]
pub struct DetectorStage {
    /// Stable name used in logs and violation records.
    pub name: String,
    /// Guard project this stage screens against.
    pub project_id: String,
    /// Whether a positive verdict here records a violation and blocks.
    pub record_policy_violation: bool,
    pub run_condition: RunCondition,
}

impl DetectorStage {
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        record_policy_violation: bool,
        run_condition: RunCondition,
    ) -> Self {
        Self {
            name: name.into(),
            project_id: project_id.into(),
            record_policy_violation,
            run_condition,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainConfigError {
    #[error("chain must have at least one stage")]
    Empty,
    #[error("the first stage must run unconditionally")]
    FirstStageConditional,
    #[error("stage {0} after the first cannot run unconditionally")]
    ExtraAlwaysStage(String),
}

/// An ordered, validated stage list.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    stages: Vec<DetectorStage>,
}

impl ChainConfig {
    /// Exactly one `Always` stage is allowed and it must come first.
    pub fn new(stages: Vec<DetectorStage>) -> Result<Self, ChainConfigError> {
        let Some(first) = stages.first() else {
            return Err(ChainConfigError::Empty);
        };
        if first.run_condition != RunCondition::Always {
            return Err(ChainConfigError::FirstStageConditional);
        }
        if let Some(extra) = stages[1..]
            .iter()
            .find(|s| s.run_condition == RunCondition::Always)
        {
            return Err(ChainConfigError::ExtraAlwaysStage(extra.name.clone()));
        }
        Ok(Self { stages })
    }

    /// The production four-stage layout: a broad non-recording screen,
    /// a recording confirmation stage, a recording re-check of
    /// negatives, and a final non-recording sweep whose positives only
    /// trigger supplementary handling.
    pub fn standard(
        screen_project: impl Into<String>,
        confirm_project: impl Into<String>,
        recheck_project: impl Into<String>,
        sweep_project: impl Into<String>,
    ) -> Self {
        Self {
            stages: vec![
                DetectorStage::new("screen", screen_project, false, RunCondition::Always),
                DetectorStage::new(
                    "confirm",
                    confirm_project,
                    true,
                    RunCondition::OnPreviousPositive,
                ),
                DetectorStage::new(
                    "recheck",
                    recheck_project,
                    true,
                    RunCondition::OnPreviousNegative,
                ),
                DetectorStage::new(
                    "sweep",
                    sweep_project,
                    false,
                    RunCondition::OnPreviousNegative,
                ),
            ],
        }
    }

    pub fn stages(&self) -> &[DetectorStage] {
        &self.stages
    }
}

/// Final decision of a chain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// No executed stage produced an actionable positive.
    Pass,
    /// A recording stage confirmed a threat; a violation must be
    /// recorded and the turn blocked.
    Blocked { stage: String },
    /// A non-recording stage flagged the input. Nothing is blocked or
    /// recorded; the caller may log or collect training data.
    FlaggedNoAction { stage: String },
}

/// What one executed stage reported.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub flagged: bool,
    pub records_violation: bool,
}

/// A completed chain run: the decision plus the stages that executed,
/// in order.
#[derive(Debug, Clone)]
pub struct ChainRun {
    pub outcome: ChainOutcome,
    pub executed: Vec<StageResult>,
}

pub struct DetectorChain {
    config: ChainConfig,
    detector: Arc<dyn ThreatDetector>,
}

impl DetectorChain {
    pub fn new(config: ChainConfig, detector: Arc<dyn ThreatDetector>) -> Self {
        Self { config, detector }
    }

    /// Run the stages over the conversation.
    ///
    /// A stage whose condition does not match the previous executed
    /// stage's verdict is skipped and does not update that verdict. The
    /// run stops early when a recording stage flags. Detector outages
    /// propagate as errors and are never folded into a verdict.
    pub async fn run(&self, messages: &[ChatTurn]) -> Result<ChainRun, DetectorError> {
        let mut executed = Vec::new();
        let mut previous_flagged = false;
        let mut flagged_no_action: Option<String> = None;

        for (i, stage) in self.config.stages().iter().enumerate() {
            let should_run = match stage.run_condition {
                RunCondition::Always => i == 0,
                RunCondition::OnPreviousPositive => previous_flagged,
                RunCondition::OnPreviousNegative => !previous_flagged,
            };
            if !should_run {
                tracing::trace!(stage = %stage.name, "stage skipped");
                continue;
            }

            let detection = self.detector.detect(&stage.project_id, messages).await?;
            tracing::debug!(stage = %stage.name, flagged = detection.flagged, "stage executed");
            executed.push(StageResult {
                stage: stage.name.clone(),
                flagged: detection.flagged,
                records_violation: stage.record_policy_violation,
            });
            previous_flagged = detection.flagged;

            if detection.flagged {
                if stage.record_policy_violation {
                    return Ok(ChainRun {
                        outcome: ChainOutcome::Blocked {
                            stage: stage.name.clone(),
                        },
                        executed,
                    });
                }
                if i > 0 {
                    // A non-recording positive past the entry stage ends
                    // the run; such stages exist for supplementary
                    // handling, not blocking.
                    flagged_no_action = Some(stage.name.clone());
                    break;
                }
            } else if i == 0 {
                // A clean entry screen admits the input outright.
                break;
            }
        }

        let outcome = match flagged_no_action {
            Some(stage) => ChainOutcome::FlaggedNoAction { stage },
            None => ChainOutcome::Pass,
        };
        Ok(ChainRun { outcome, executed })
    }
}
