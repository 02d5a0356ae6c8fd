//! Regex-based redaction of personal data in outgoing user content and
//! logged model output.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use super::{Callback, RunContext};
use crate::error::AgentError;
use crate::loops::StepOutput;
use crate::schema::{ContentPart, Message, UserContent};

const REDACTED: &str = "[REDACTED]";

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // email addresses
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            // US-style SSN
            r"\b\d{3}-\d{2}-\d{4}\b",
            // 13-16 digit card numbers, with or without separators
            r"\b(?:\d[ -]?){13,16}\b",
            // international-ish phone numbers
            r"\+\d{1,3}[ -]?\(?\d{1,4}\)?[ -]?\d{3,4}[ -]?\d{3,4}\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

fn scrub(text: &str) -> String {
    let mut out = text.to_string();
    for re in patterns() {
        out = re.replace_all(&out, REDACTED).into_owned();
    }
    out
}

fn scrub_part(part: ContentPart) -> ContentPart {
    match part {
        ContentPart::InputText { text } => ContentPart::InputText { text: scrub(&text) },
        ContentPart::OutputText { text } => ContentPart::OutputText { text: scrub(&text) },
        ContentPart::SummaryText { text } => ContentPart::SummaryText { text: scrub(&text) },
        image => image,
    }
}

/// Scrubs user text on the way out to providers and model text on the way
/// into the trajectory. Register it ahead of [`super::TrajectoryWriter`] so
/// logged input is the scrubbed input.
pub struct PiiScrubber;

#[async_trait]
impl Callback for PiiScrubber {
    async fn before_turn(&self, _ctx: &RunContext, messages: Vec<Message>) -> Vec<Message> {
        messages
            .into_iter()
            .map(|msg| match msg {
                Message::User { content } => Message::User {
                    content: match content {
                        UserContent::Text(text) => UserContent::Text(scrub(&text)),
                        UserContent::Parts(parts) => {
                            UserContent::Parts(parts.into_iter().map(scrub_part).collect())
                        }
                    },
                },
                other => other,
            })
            .collect()
    }

    async fn after_llm(
        &self,
        _ctx: &RunContext,
        resp: StepOutput,
    ) -> Result<StepOutput, AgentError> {
        Ok(StepOutput {
            messages: resp
                .messages
                .into_iter()
                .map(|msg| match msg {
                    Message::Assistant { content } => Message::Assistant {
                        content: content.into_iter().map(scrub_part).collect(),
                    },
                    Message::Reasoning { summary } => Message::Reasoning {
                        summary: summary.into_iter().map(scrub_part).collect(),
                    },
                    other => other,
                })
                .collect(),
            usage: resp.usage,
        })
    }
}
