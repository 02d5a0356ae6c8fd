//! Planner+grounder composite.
//!
//! The planner sees the full history and decides what to do next; when it
//! cannot point at pixels itself it emits a `ground` function call carrying a
//! natural-language intent, and the grounder turns that intent plus the
//! current screenshot into a concrete click.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{
    latest_screenshot_b64, AgentLoop, Capability, StepOutput, TurnInput,
};
use crate::error::AgentError;
use crate::schema::{Action, CallStatus, Message, MouseButton};

/// Name of the bridge tool the planner calls to request grounding.
pub const GROUND_TOOL: &str = "ground";

pub struct CompositeLoop {
    planner: Box<dyn AgentLoop>,
    grounder: Box<dyn AgentLoop>,
}

impl CompositeLoop {
    pub fn new(planner: Box<dyn AgentLoop>, grounder: Box<dyn AgentLoop>) -> Self {
        Self { planner, grounder }
    }

    /// Pull the grounding intent out of the function call's arguments: either
    /// a bare string or `{"instruction": "..."}`.
    fn intent_of(arguments: &str) -> String {
        match serde_json::from_str::<Value>(arguments) {
            Ok(Value::String(s)) => s,
            Ok(value) => value["instruction"]
                .as_str()
                .or_else(|| value["intent"].as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| arguments.to_string()),
            Err(_) => arguments.to_string(),
        }
    }
}

#[async_trait]
impl AgentLoop for CompositeLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step]
    }

    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let planner_turn = TurnInput {
            messages: turn.messages,
            dims: turn.dims,
            os_type: turn.os_type,
            env: turn.env,
            image_retention_window: turn.image_retention_window,
            timeout: turn.timeout,
        };
        let mut output = self.planner.step(planner_turn).await?;

        // Action first: a planner that already grounded itself wins outright.
        if output
            .messages
            .iter()
            .any(|m| matches!(m, Message::ComputerCall { .. }))
        {
            return Ok(output);
        }

        let ground_request = output.messages.iter().find_map(|m| match m {
            Message::FunctionCall {
                name, arguments, ..
            } if name == GROUND_TOOL => Some(Self::intent_of(arguments)),
            _ => None,
        });

        let Some(intent) = ground_request else {
            // Terminal assistant text, or a foreign function call for the
            // orchestrator's tool routing. Either way, pass through.
            return Ok(output);
        };

        let screenshot = latest_screenshot_b64(turn.messages).ok_or_else(|| {
            AgentError::Target("grounding requested but history holds no screenshot".to_string())
        })?;

        let prediction = self
            .grounder
            .predict_click(turn.env, &screenshot, &intent, turn.dims)
            .await?;
        output.usage.add(&prediction.usage);

        let (x, y) = prediction.point.ok_or_else(|| {
            AgentError::Target(format!("grounder could not locate: {intent}"))
        })?;

        tracing::debug!(intent = %intent, x, y, "grounded intent to coordinates");

        output.messages.push(Message::ComputerCall {
            call_id: format!("call_{}", Uuid::new_v4().simple()),
            status: CallStatus::Completed,
            action: Action::Click {
                button: MouseButton::Left,
                x,
                y,
            },
            pending_safety_checks: vec![],
        });

        Ok(output)
    }
}
