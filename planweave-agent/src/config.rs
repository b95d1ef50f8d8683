//! Configuration for the agent.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use planweave_safety::{
    ChainConfig, DetectorChain, GuardDetector, Moderator, SafetyPipeline, SafetyViolations,
    SafetyViolationsConfig, ViolationStore,
};

/// Configuration for a co-authoring agent deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Backend configuration
    #[serde(default)]
    pub backend: BackendConfig,
    /// Per-session settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Safety gating settings
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl AgentConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the chat-completions API
    pub base_url: String,
    /// Model name
    pub model: String,
    /// Maximum tokens per completion
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wall-clock budget for one generation stream (seconds)
    pub stream_budget_secs: u64,
    /// Whether finished turns are moderated
    pub moderation_enabled: bool,
    /// Outbound record channel capacity
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_budget_secs: 120, // 2 minutes
            moderation_enabled: true,
            channel_capacity: 64,
        }
    }
}

/// Safety gating settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Guard API base URL
    pub guard_base_url: String,
    /// Guard project ids for the four standard chain stages
    pub screen_project: String,
    pub confirm_project: String,
    pub recheck_project: String,
    pub sweep_project: String,
    /// Violations inside the window at which an account is banned
    pub ban_threshold: usize,
    /// Rolling violation window (days)
    pub window_days: i64,
}

impl SafetyConfig {
    /// The standard four-stage chain over the configured guard projects.
    pub fn chain(&self, guard_api_key: impl Into<String>) -> DetectorChain {
        let detector = GuardDetector::new(self.guard_base_url.clone(), guard_api_key);
        DetectorChain::new(
            ChainConfig::standard(
                self.screen_project.clone(),
                self.confirm_project.clone(),
                self.recheck_project.clone(),
                self.sweep_project.clone(),
            ),
            Arc::new(detector),
        )
    }

    /// The ban ledger over `store`, with the configured threshold and
    /// window.
    pub fn violations(&self, store: Arc<dyn ViolationStore>) -> SafetyViolations {
        SafetyViolations::new(store).with_config(SafetyViolationsConfig {
            ban_threshold: self.ban_threshold,
            window_days: self.window_days,
        })
    }

    /// Assemble the full safety pipeline: detector chain, moderator,
    /// ban ledger.
    pub fn build_pipeline(
        &self,
        guard_api_key: impl Into<String>,
        moderator: Arc<dyn Moderator>,
        store: Arc<dyn ViolationStore>,
    ) -> Arc<SafetyPipeline> {
        Arc::new(SafetyPipeline::new(
            self.chain(guard_api_key),
            moderator,
            Arc::new(self.violations(store)),
        ))
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            guard_base_url: "https://api.lakera.ai".to_string(),
            screen_project: "project-screen".to_string(),
            confirm_project: "project-confirm".to_string(),
            recheck_project: "project-recheck".to_string(),
            sweep_project: "project-sweep".to_string(),
            ban_threshold: 5,
            window_days: 30,
        }
    }
}
