//! Prepends operator instructions to every turn.
//!
//! A minimal, loop-agnostic way to steer behavior: it only rewrites the
//! message list, so it works with any provider.

use async_trait::async_trait;

use super::{Callback, RunContext};
use crate::schema::{Message, UserContent};

pub struct PromptInstructions {
    instructions: String,
}

impl PromptInstructions {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }
}

#[async_trait]
impl Callback for PromptInstructions {
    async fn before_turn(&self, _ctx: &RunContext, messages: Vec<Message>) -> Vec<Message> {
        if self.instructions.is_empty() {
            return messages;
        }
        // Don't stack a second copy if we're already at the front.
        if let Some(Message::User {
            content: UserContent::Text(text),
        }) = messages.first()
        {
            if *text == self.instructions {
                return messages;
            }
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(Message::user_text(self.instructions.clone()));
        out.extend(messages);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            session_id: "s".to_string(),
            model: "m".to_string(),
        }
    }

    #[tokio::test]
    async fn prepends_once() {
        let cb = PromptInstructions::new("never open the terminal");
        let messages = vec![Message::user_text("do the task")];
        let once = cb.before_turn(&ctx(), messages).await;
        assert_eq!(once.len(), 2);
        let twice = cb.before_turn(&ctx(), once.clone()).await;
        assert_eq!(twice, once);
    }
}
