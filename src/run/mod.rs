//! The run orchestrator: drives one task to termination.

mod orchestrator;
pub mod retry;

#[cfg(test)]
pub(crate) mod tests;

pub use orchestrator::{Orchestrator, ToolRouter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::callbacks::{CallbackPipeline, RunContext};
use crate::env::EnvSnapshot;
use crate::error::{AgentError, RunStatus};
use crate::llm::{LlmPort, ProviderRequest, ProviderResponse};
use crate::schema::{Message, Usage};

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Cap on ASK transitions.
    pub max_steps: usize,
    pub per_turn_timeout: Duration,
    pub per_action_timeout: Duration,
    /// Wall clock for the whole run.
    pub run_timeout: Duration,
    pub image_retention_window: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            per_turn_timeout: Duration::from_secs(120),
            per_action_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(30 * 60),
            image_retention_window: None,
        }
    }
}

/// Outcome of a run. Exactly one status; output always holds at least one
/// user message and one terminal assistant message, with every
/// `computer_call` matched by a `computer_call_output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub output: Vec<Message>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// LLM port wrapper that threads `before_llm` callbacks in front of every
/// provider call, so callbacks can shape the wire request the adapter built.
pub struct HookedLlmPort {
    inner: Arc<dyn LlmPort>,
    callbacks: CallbackPipeline,
    ctx: RunContext,
}

impl HookedLlmPort {
    pub fn new(inner: Arc<dyn LlmPort>, callbacks: CallbackPipeline, ctx: RunContext) -> Self {
        Self {
            inner,
            callbacks,
            ctx,
        }
    }
}

#[async_trait]
impl LlmPort for HookedLlmPort {
    async fn chat(
        &self,
        req: ProviderRequest,
        env: &EnvSnapshot,
    ) -> Result<ProviderResponse, AgentError> {
        let req = self.callbacks.before_llm(&self.ctx, req).await;
        self.inner.chat(req, env).await
    }
}
