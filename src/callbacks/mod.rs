//! Ordered middleware applied around LLM calls, actions, screenshots, and
//! whole runs.
//!
//! Callbacks compose like onion layers: input-shaping hooks (`before_*`) run
//! left-to-right in registration order, output-shaping hooks (`after_*`,
//! `on_screenshot`) run right-to-left. Every shaping hook takes and returns
//! owned values; nothing is mutated in place. The pipeline owns no state
//! beyond the ordered list.

mod budget;
mod cache;
mod image_retention;
mod pii;
mod prompt_instructions;
mod trajectory;

pub use budget::BudgetCap;
pub use cache::PromptCacheHinter;
pub use image_retention::ImageRetention;
pub use pii::PiiScrubber;
pub use prompt_instructions::PromptInstructions;
pub use trajectory::TrajectoryWriter;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AgentError;
use crate::llm::ProviderRequest;
use crate::loops::StepOutput;
use crate::run::RunResult;
use crate::schema::{Action, Message};

/// Identity of the run a hook fires in.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub session_id: String,
    pub model: String,
}

/// Outcome of `before_action`: run the (possibly rewritten) action, or drop
/// it silently and substitute a synthetic output.
#[derive(Debug, Clone)]
pub enum ActionDecision {
    Proceed(Action),
    Skip,
}

/// Outcome of `on_error`: keep propagating (possibly transformed), or resume
/// the loop at the next turn with replacement messages.
#[derive(Debug)]
pub enum ErrorDecision {
    Propagate(AgentError),
    Recover(Vec<Message>),
}

/// A middleware. Implement any subset of hooks; defaults are pass-through.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn on_run_start(&self, _ctx: &RunContext) {}

    async fn on_run_end(&self, _ctx: &RunContext, _result: &RunResult) {}

    async fn before_turn(&self, _ctx: &RunContext, messages: Vec<Message>) -> Vec<Message> {
        messages
    }

    async fn before_llm(&self, _ctx: &RunContext, req: ProviderRequest) -> ProviderRequest {
        req
    }

    /// May raise to end the run (e.g. budget); raising is not recoverable
    /// through `on_error`.
    async fn after_llm(
        &self,
        _ctx: &RunContext,
        resp: StepOutput,
    ) -> Result<StepOutput, AgentError> {
        Ok(resp)
    }

    async fn before_action(&self, _ctx: &RunContext, action: Action) -> ActionDecision {
        ActionDecision::Proceed(action)
    }

    async fn after_action(
        &self,
        _ctx: &RunContext,
        _action: &Action,
        result: Message,
    ) -> Message {
        result
    }

    async fn on_screenshot(&self, _ctx: &RunContext, png: Vec<u8>) -> Vec<u8> {
        png
    }

    async fn on_error(&self, _ctx: &RunContext, err: AgentError) -> ErrorDecision {
        ErrorDecision::Propagate(err)
    }
}

/// The ordered list. Copy-on-register; iterated without locking.
#[derive(Clone)]
pub struct CallbackPipeline {
    callbacks: Arc<[Arc<dyn Callback>]>,
}

impl CallbackPipeline {
    pub fn new(callbacks: Vec<Arc<dyn Callback>>) -> Self {
        Self {
            callbacks: callbacks.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub async fn on_run_start(&self, ctx: &RunContext) {
        for cb in self.callbacks.iter() {
            cb.on_run_start(ctx).await;
        }
    }

    pub async fn on_run_end(&self, ctx: &RunContext, result: &RunResult) {
        for cb in self.callbacks.iter().rev() {
            cb.on_run_end(ctx, result).await;
        }
    }

    pub async fn before_turn(&self, ctx: &RunContext, mut messages: Vec<Message>) -> Vec<Message> {
        for cb in self.callbacks.iter() {
            messages = cb.before_turn(ctx, messages).await;
        }
        messages
    }

    pub async fn before_llm(&self, ctx: &RunContext, mut req: ProviderRequest) -> ProviderRequest {
        for cb in self.callbacks.iter() {
            req = cb.before_llm(ctx, req).await;
        }
        req
    }

    pub async fn after_llm(
        &self,
        ctx: &RunContext,
        mut resp: StepOutput,
    ) -> Result<StepOutput, AgentError> {
        for cb in self.callbacks.iter().rev() {
            resp = cb.after_llm(ctx, resp).await?;
        }
        Ok(resp)
    }

    pub async fn before_action(&self, ctx: &RunContext, mut action: Action) -> ActionDecision {
        for cb in self.callbacks.iter() {
            match cb.before_action(ctx, action).await {
                ActionDecision::Proceed(next) => action = next,
                ActionDecision::Skip => return ActionDecision::Skip,
            }
        }
        ActionDecision::Proceed(action)
    }

    pub async fn after_action(
        &self,
        ctx: &RunContext,
        action: &Action,
        mut result: Message,
    ) -> Message {
        for cb in self.callbacks.iter().rev() {
            result = cb.after_action(ctx, action, result).await;
        }
        result
    }

    pub async fn on_screenshot(&self, ctx: &RunContext, mut png: Vec<u8>) -> Vec<u8> {
        for cb in self.callbacks.iter().rev() {
            png = cb.on_screenshot(ctx, png).await;
        }
        png
    }

    pub async fn on_error(&self, ctx: &RunContext, mut err: AgentError) -> ErrorDecision {
        for cb in self.callbacks.iter() {
            match cb.on_error(ctx, err).await {
                ErrorDecision::Propagate(next) => err = next,
                ErrorDecision::Recover(messages) => return ErrorDecision::Recover(messages),
            }
        }
        ErrorDecision::Propagate(err)
    }
}
