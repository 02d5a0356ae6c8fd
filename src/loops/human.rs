//! Human-in-the-loop adapter.
//!
//! Makes no LLM call. Each step blocks on an externally provided channel
//! until a person supplies the next action or a terminal message.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{AgentLoop, Capability, StepOutput, TurnInput};
use crate::error::AgentError;
use crate::schema::{Action, CallStatus, Message};

/// What the human decided for the current turn.
#[derive(Debug, Clone)]
pub enum HumanDecision {
    /// Perform this action and continue.
    Act(Action),
    /// Finish the run with this message.
    Finish(String),
}

/// Receiving end handed to the adapter at construction.
pub type HumanInbox = mpsc::Receiver<HumanDecision>;

pub struct HumanLoop {
    inbox: Mutex<HumanInbox>,
}

impl HumanLoop {
    pub fn new(inbox: HumanInbox) -> Self {
        Self {
            inbox: Mutex::new(inbox),
        }
    }

    /// Convenience pair: the adapter plus the sender a UI drives it with.
    pub fn channel(buffer: usize) -> (mpsc::Sender<HumanDecision>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl AgentLoop for HumanLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step]
    }

    async fn step(&self, _turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let decision = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AgentError::Target("human decision channel closed".to_string()))?;

        let messages = match decision {
            HumanDecision::Act(action) => {
                action.validate()?;
                vec![Message::ComputerCall {
                    call_id: format!("call_{}", Uuid::new_v4().simple()),
                    status: CallStatus::Completed,
                    action,
                    pending_safety_checks: vec![],
                }]
            }
            HumanDecision::Finish(text) => vec![Message::assistant_text(text)],
        };

        Ok(StepOutput {
            messages,
            usage: Default::default(),
        })
    }
}
