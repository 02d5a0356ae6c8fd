//! The run state machine.
//!
//! ```text
//! INIT → CAPTURE → ASK → ACT → OBSERVE → (ASK | DONE | FAIL)
//! ```
//!
//! One orchestrator drives one run, strictly sequentially. Cancellation is
//! checked before every state transition and at retry boundaries; transient
//! transport errors are retried with back-off inside ASK/ACT so callbacks
//! only ever see errors that survived the retry cap.

use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::retry::Backoff;
use super::{RunConfig, RunResult};
use crate::callbacks::{ActionDecision, CallbackPipeline, ErrorDecision, RunContext};
use crate::computer::Computer;
use crate::env::EnvSnapshot;
use crate::error::{AgentError, RunStatus};
use crate::loops::{AgentLoop, StepOutput, TurnInput};
use crate::schema::{
    is_terminal, Action, ContentPart, Message, MouseButton, SafetyCheck, Usage, UserContent,
    SYNTHETIC_SCREENSHOT_URL,
};

/// Routes `function_call` items to tools living outside the core. Unknown
/// names fail with [`AgentError::UnknownTool`].
#[async_trait]
pub trait ToolRouter: Send + Sync {
    async fn call(&self, name: &str, arguments: &str) -> Result<String, AgentError>;
}

pub struct Orchestrator {
    agent: Box<dyn AgentLoop>,
    computer: Arc<dyn Computer>,
    callbacks: CallbackPipeline,
    tools: Option<Arc<dyn ToolRouter>>,
    config: RunConfig,
    env: EnvSnapshot,
    ctx: RunContext,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Box<dyn AgentLoop>,
        computer: Arc<dyn Computer>,
        callbacks: CallbackPipeline,
        tools: Option<Arc<dyn ToolRouter>>,
        config: RunConfig,
        env: EnvSnapshot,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            computer,
            callbacks,
            tools,
            config,
            env,
            ctx,
            cancel,
        }
    }

    /// Drive the run to termination. Always returns a structured result with
    /// exactly one terminal status; errors never escape as panics or raw
    /// `Err`s.
    pub async fn run(&self, input: Vec<Message>) -> RunResult {
        if !input.iter().any(|m| matches!(m, Message::User { .. })) {
            let mut output = input;
            output.push(Message::assistant_text(
                "The run failed: input must contain at least one user message.",
            ));
            return RunResult {
                status: RunStatus::Failed,
                output,
                usage: Usage::default(),
                error: Some("input must contain at least one user message".to_string()),
            };
        }

        tracing::info!(run_id = %self.ctx.run_id, model = %self.ctx.model, "run started");
        self.callbacks.on_run_start(&self.ctx).await;

        let mut history = input;
        let mut usage = Usage::default();
        let outcome = self.drive(&mut history, &mut usage).await;
        let result = self.finish(history, usage, outcome);

        self.callbacks.on_run_end(&self.ctx, &result).await;
        tracing::info!(
            run_id = %self.ctx.run_id,
            status = %result.status,
            total_tokens = result.usage.total_tokens,
            cost = result.usage.response_cost,
            "run finished"
        );
        result
    }

    async fn drive(
        &self,
        history: &mut Vec<Message>,
        usage: &mut Usage,
    ) -> Result<(), AgentError> {
        let deadline = Instant::now() + self.config.run_timeout;

        // CAPTURE: seed the conversation with what the screen looks like.
        self.check_cancel()?;
        let png = self.screenshot(deadline).await?;
        let png = self.callbacks.on_screenshot(&self.ctx, png).await;
        history.push(Message::User {
            content: UserContent::Parts(vec![ContentPart::InputImage {
                image_url: encode_png(&png),
            }]),
        });

        let dims = match self.computer.dimensions().await {
            Ok(dims) => dims,
            Err(e) => {
                tracing::warn!(error = %e, "could not read display size, assuming 1024x768");
                (1024, 768)
            }
        };

        let mut steps = 0usize;
        loop {
            self.check_cancel()?;
            if Instant::now() >= deadline {
                return Err(AgentError::Target(
                    "run wall-clock limit exceeded".to_string(),
                ));
            }
            if steps >= self.config.max_steps {
                return Err(AgentError::StepLimitReached(steps));
            }
            steps += 1;

            // ASK
            let shaped = self.callbacks.before_turn(&self.ctx, history.clone()).await;
            let step_out = match self.ask(&shaped, dims).await {
                Ok(out) => out,
                Err(e) => {
                    self.absorb(history, e).await?;
                    continue;
                }
            };
            // A callback raising here (budget) ends the run; not recoverable.
            let step_out = self.callbacks.after_llm(&self.ctx, step_out).await?;

            usage.add(&step_out.usage);
            history.extend(step_out.messages.clone());

            let calls: Vec<(String, Action, Vec<SafetyCheck>)> = step_out
                .messages
                .iter()
                .filter_map(|m| match m {
                    Message::ComputerCall {
                        call_id,
                        action,
                        pending_safety_checks,
                        ..
                    } => Some((call_id.clone(), action.clone(), pending_safety_checks.clone())),
                    _ => None,
                })
                .collect();

            if calls.is_empty() {
                let functions: Vec<(String, String, String)> = step_out
                    .messages
                    .iter()
                    .filter_map(|m| match m {
                        Message::FunctionCall {
                            call_id,
                            name,
                            arguments,
                            ..
                        } => Some((call_id.clone(), name.clone(), arguments.clone())),
                        _ => None,
                    })
                    .collect();

                if functions.is_empty() {
                    if is_terminal(&step_out.messages) {
                        return Ok(());
                    }
                    self.absorb(
                        history,
                        AgentError::Target(
                            "model produced neither an action nor a terminal message".to_string(),
                        ),
                    )
                    .await?;
                    continue;
                }

                for (call_id, name, arguments) in functions {
                    match self.route_function(&name, &arguments).await {
                        Ok(output) => history.push(Message::FunctionCallOutput { call_id, output }),
                        Err(e) => {
                            self.absorb(history, e).await?;
                        }
                    }
                }
                continue;
            }

            // ACT + OBSERVE, one balanced pair per call.
            for (call_id, action, pending) in calls {
                match self.act_and_observe(&call_id, &action, &pending, deadline).await {
                    Ok(output) => history.push(output),
                    Err(e) => {
                        // Balance the pair before deciding anything else.
                        history.push(synthetic_output(&call_id, &pending));
                        self.absorb(history, e).await?;
                    }
                }
            }
        }
    }

    /// One LLM turn with the transport retry policy.
    async fn ask(&self, messages: &[Message], dims: (u32, u32)) -> Result<StepOutput, AgentError> {
        let policy = Backoff::llm();
        let mut attempt = 0u32;
        loop {
            self.check_cancel()?;
            let turn = TurnInput {
                messages,
                dims,
                os_type: self.computer.os_type(),
                env: &self.env,
                image_retention_window: self.config.image_retention_window,
                timeout: self.config.per_turn_timeout,
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
                stepped = tokio::time::timeout(self.config.per_turn_timeout, self.agent.step(turn)) => {
                    match stepped {
                        Ok(inner) => inner,
                        Err(_) => Err(AgentError::Transport("LLM turn timed out".to_string())),
                    }
                }
            };
            match result {
                Ok(out) => return Ok(out),
                Err(e) if e.is_transient() && attempt + 1 < policy.max_tries => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        run_id = %self.ctx.run_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying LLM turn"
                    );
                    self.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `before_action`, dispatch to the computer, take the observation
    /// screenshot, and shape the output through `after_action`.
    async fn act_and_observe(
        &self,
        call_id: &str,
        action: &Action,
        pending: &[SafetyCheck],
        deadline: Instant,
    ) -> Result<Message, AgentError> {
        self.check_cancel()?;
        action.validate()?;

        let decision = self.callbacks.before_action(&self.ctx, action.clone()).await;
        let output = match decision {
            ActionDecision::Skip => {
                tracing::debug!(run_id = %self.ctx.run_id, kind = action.kind(), "action skipped by callback");
                synthetic_output(call_id, pending)
            }
            ActionDecision::Proceed(effective) => {
                self.dispatch(&effective).await?;

                // OBSERVE
                let png = self.screenshot(deadline).await?;
                let png = self.callbacks.on_screenshot(&self.ctx, png).await;
                Message::ComputerCallOutput {
                    call_id: call_id.to_string(),
                    output: ContentPart::ComputerScreenshot {
                        image_url: encode_png(&png),
                    },
                    acknowledged_safety_checks: pending.to_vec(),
                }
            }
        };

        Ok(self.callbacks.after_action(&self.ctx, action, output).await)
    }

    /// Dispatch one action to the computer port, with the computer retry
    /// policy and the per-action timeout.
    async fn dispatch(&self, action: &Action) -> Result<(), AgentError> {
        let policy = Backoff::computer();
        let mut attempt = 0u32;
        loop {
            self.check_cancel()?;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
                performed = tokio::time::timeout(self.config.per_action_timeout, self.perform(action)) => {
                    match performed {
                        Ok(inner) => inner,
                        Err(_) => Err(AgentError::Transport(format!(
                            "action {} timed out",
                            action.kind()
                        ))),
                    }
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < policy.max_tries => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        run_id = %self.ctx.run_id,
                        attempt,
                        error = %e,
                        "retrying computer action"
                    );
                    self.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The mechanical mapping from canonical actions to port calls.
    async fn perform(&self, action: &Action) -> Result<(), AgentError> {
        let computer = &self.computer;
        match action {
            Action::Click { button, x, y } => {
                computer.move_cursor(*x, *y).await?;
                match button {
                    MouseButton::Left => computer.left_click(*x, *y).await?,
                    MouseButton::Right => computer.right_click(*x, *y).await?,
                    other => {
                        computer.mouse_down(*x, *y, *other).await?;
                        computer.mouse_up(*x, *y, *other).await?;
                    }
                }
            }
            Action::DoubleClick { x, y, .. } => {
                computer.move_cursor(*x, *y).await?;
                computer.double_click(*x, *y).await?;
            }
            Action::Drag { button, path } => {
                computer.drag(path, *button, 500).await?;
            }
            Action::Move { x, y } => computer.move_cursor(*x, *y).await?,
            Action::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => computer.scroll(*x, *y, *scroll_x, *scroll_y).await?,
            Action::Keypress { keys } => computer.press_keys(keys).await?,
            Action::TypeText { text } => computer.type_text(text).await?,
            // The observation screenshot that follows every action is the
            // screenshot; nothing to do here.
            Action::Screenshot => {}
            Action::Wait => computer.wait(1000).await?,
            Action::LeftMouseDown { x, y } => {
                computer.mouse_down(*x, *y, MouseButton::Left).await?
            }
            Action::LeftMouseUp { x, y } => computer.mouse_up(*x, *y, MouseButton::Left).await?,
        }
        Ok(())
    }

    async fn screenshot(&self, _deadline: Instant) -> Result<Vec<u8>, AgentError> {
        let policy = Backoff::computer();
        let mut attempt = 0u32;
        loop {
            self.check_cancel()?;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
                shot = tokio::time::timeout(self.config.per_action_timeout, self.computer.screenshot()) => {
                    match shot {
                        Ok(inner) => inner.map_err(AgentError::from),
                        Err(_) => Err(AgentError::Transport("screenshot timed out".to_string())),
                    }
                }
            };
            match result {
                Ok(png) => return Ok(png),
                Err(e) if e.is_transient() && attempt + 1 < policy.max_tries => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    self.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn route_function(&self, name: &str, arguments: &str) -> Result<String, AgentError> {
        match &self.tools {
            Some(router) => router.call(name, arguments).await,
            None => Err(AgentError::UnknownTool(name.to_string())),
        }
    }

    /// Give callbacks a chance to recover from an error that survived the
    /// retry machinery. Recovery appends the replacement messages and lets
    /// the loop continue; everything else propagates.
    async fn absorb(
        &self,
        history: &mut Vec<Message>,
        err: AgentError,
    ) -> Result<(), AgentError> {
        match err {
            AgentError::Transport(_) | AgentError::Target(_) | AgentError::UnknownTool(_) => {
                match self.callbacks.on_error(&self.ctx, err).await {
                    ErrorDecision::Recover(messages) => {
                        tracing::info!(run_id = %self.ctx.run_id, "callback recovered from error");
                        history.extend(messages);
                        Ok(())
                    }
                    ErrorDecision::Propagate(e) => Err(e),
                }
            }
            terminal => Err(terminal),
        }
    }

    fn finish(
        &self,
        mut history: Vec<Message>,
        usage: Usage,
        outcome: Result<(), AgentError>,
    ) -> RunResult {
        balance_calls(&mut history);

        let (status, error) = match outcome {
            Ok(()) => {
                if !is_terminal(&history) {
                    history.push(Message::assistant_text("Task finished."));
                }
                (RunStatus::Completed, None)
            }
            Err(AgentError::Cancelled) => {
                history.push(Message::assistant_text(
                    "Run cancelled before the task finished.",
                ));
                (RunStatus::Cancelled, Some("cancelled".to_string()))
            }
            Err(e @ AgentError::BudgetExceeded { .. }) => {
                history.push(Message::assistant_text(format!(
                    "Stopping: the trajectory budget was reached ({e})."
                )));
                (RunStatus::Completed, None)
            }
            Err(e @ AgentError::StepLimitReached(_)) => {
                history.push(Message::assistant_text(format!(
                    "Stopping: the step limit was reached ({e})."
                )));
                (RunStatus::Completed, None)
            }
            Err(e) => {
                history.push(Message::assistant_text(format!("The run failed: {e}")));
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        RunResult {
            status,
            output: history,
            usage,
            error,
        }
    }

    fn check_cancel(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), AgentError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn encode_png(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

fn synthetic_output(call_id: &str, pending: &[SafetyCheck]) -> Message {
    Message::ComputerCallOutput {
        call_id: call_id.to_string(),
        output: ContentPart::ComputerScreenshot {
            image_url: SYNTHETIC_SCREENSHOT_URL.to_string(),
        },
        acknowledged_safety_checks: pending.to_vec(),
    }
}

/// Guarantee call/output adjacency: every `computer_call` is immediately
/// followed by its `computer_call_output`, inserting synthetic outputs where
/// a real one never arrived.
fn balance_calls(history: &mut Vec<Message>) {
    let mut balanced = Vec::with_capacity(history.len());
    let mut iter = std::mem::take(history).into_iter().peekable();
    while let Some(msg) = iter.next() {
        if let Message::ComputerCall {
            call_id,
            pending_safety_checks,
            ..
        } = &msg
        {
            let matched = matches!(
                iter.peek(),
                Some(Message::ComputerCallOutput { call_id: next_id, .. }) if next_id == call_id
            );
            if !matched {
                let fill = synthetic_output(call_id, pending_safety_checks);
                balanced.push(msg);
                balanced.push(fill);
                continue;
            }
        }
        balanced.push(msg);
    }
    *history = balanced;
}
