//! Plugin hooks for session events.
//!
//! Hosts register plugins for the events they care about; every hook has
//! a default no-op body, so a plugin implements only its own concerns.
//! Dispatch is sequential in registration order and a hook error aborts
//! the turn. A hook may also hand its context background work, which
//! the session settles before it considers the turn finished.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use planweave_protocol::Record;
use planweave_safety::ModerationRecord;

use crate::error::AgentError;

#[derive(Debug, Error)]
#[error("plugin {plugin} failed: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// What a hook gets to work with: session identity, the outbound record
/// channel, and the turn's background work registry.
#[derive(Clone)]
pub struct PluginContext {
    pub conversation_id: String,
    pub user_id: Option<String>,
    outbound: mpsc::Sender<Record>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PluginContext {
    /// Enqueue a record on the session's outbound stream.
    pub async fn enqueue(&self, record: Record) {
        if self.outbound.send(record).await.is_err() {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                "outbound channel closed; plugin record dropped"
            );
        }
    }

    /// Spawn background work owned by the turn. The session settles it
    /// before the turn is considered finished.
    pub async fn spawn_background<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.background.lock().await.push(handle);
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// The stream failed or was blocked. The error is also surfaced to
    /// the caller; this hook exists for side effects such as notifying
    /// the client.
    async fn on_stream_error(
        &self,
        _error: &AgentError,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// The finished turn's moderation verdict came back toxic.
    async fn on_toxic_moderation(
        &self,
        _record: &ModerationRecord,
        _ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Sequential plugin dispatcher with a background work registry.
#[derive(Default)]
pub struct PluginDispatcher {
    plugins: Vec<Arc<dyn Plugin>>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PluginDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Mint a hook context whose background work lands in this
    /// dispatcher's registry, so [`settle`](Self::settle) waits for it.
    pub fn context(
        &self,
        conversation_id: impl Into<String>,
        user_id: Option<String>,
        outbound: mpsc::Sender<Record>,
    ) -> PluginContext {
        PluginContext {
            conversation_id: conversation_id.into(),
            user_id,
            outbound,
            background: Arc::clone(&self.background),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run `on_stream_error` on every plugin in order. The first error
    /// stops dispatch and propagates.
    pub async fn dispatch_stream_error(
        &self,
        error: &AgentError,
        ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            tracing::debug!(plugin = plugin.name(), "dispatching stream error hook");
            plugin.on_stream_error(error, ctx).await?;
        }
        Ok(())
    }

    /// Run `on_toxic_moderation` on every plugin in order.
    pub async fn dispatch_toxic_moderation(
        &self,
        record: &ModerationRecord,
        ctx: &PluginContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            tracing::debug!(plugin = plugin.name(), "dispatching toxic moderation hook");
            plugin.on_toxic_moderation(record, ctx).await?;
        }
        Ok(())
    }

    /// Spawn background work owned by the turn.
    pub async fn spawn_background<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.background.lock().await.push(handle);
    }

    /// Await all outstanding background work. Panicked tasks are logged
    /// and ignored; background work never fails the turn.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().await;
            background.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background plugin task failed");
            }
        }
    }
}
