//! Keeps the conversation's screenshot weight bounded.

use async_trait::async_trait;

use super::{Callback, RunContext};
use crate::loops::rewindow_images;
use crate::schema::Message;

/// Rewrites the message list before every turn so at most N screenshots stay
/// expanded; older ones collapse to a placeholder. Prevents context-window
/// overflow on long runs.
pub struct ImageRetention {
    window: usize,
}

impl ImageRetention {
    pub fn new(window: usize) -> Self {
        Self { window }
    }
}

#[async_trait]
impl Callback for ImageRetention {
    async fn before_turn(&self, _ctx: &RunContext, messages: Vec<Message>) -> Vec<Message> {
        rewindow_images(&messages, Some(self.window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loops::expanded_image_count;
    use crate::schema::{Action, CallStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn caps_expanded_screenshots() {
        let mut messages = vec![Message::user_text("go")];
        for n in 0..6 {
            messages.push(Message::ComputerCall {
                call_id: format!("call_{n}"),
                status: CallStatus::Completed,
                action: Action::Screenshot,
                pending_safety_checks: vec![],
            });
            messages.push(Message::screenshot_output(
                format!("call_{n}"),
                format!("data:image/png;base64,IMG{n}"),
            ));
        }

        let ctx = RunContext {
            run_id: Uuid::new_v4(),
            session_id: "s".to_string(),
            model: "m".to_string(),
        };
        let trimmed = ImageRetention::new(3).before_turn(&ctx, messages).await;
        assert_eq!(expanded_image_count(&trimmed), 3);
    }
}
