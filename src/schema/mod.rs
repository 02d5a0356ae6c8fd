//! Canonical wire schema for messages, content parts, actions, and usage.
//!
//! Every adapter converts to and from these types; no provider-specific shape
//! escapes the core. Encoding is stable JSON keyed by a `type` tag; decoding
//! is tolerant of unknown fields. Unknown `type` tags are rejected at the
//! HTTP trust boundary and skipped inside trusted adapters
//! (see [`Message::decode_lenient`]).

mod actions;
mod messages;

pub use actions::{Action, MouseButton, Point};
pub use messages::{
    is_terminal, CallStatus, ContentPart, Message, SafetyCheck, UserContent,
    SYNTHETIC_SCREENSHOT_URL,
};

use serde::{Deserialize, Serialize};

/// Token and cost accounting, accumulated per turn and surfaced per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub response_cost: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            response_cost: 0.0,
        }
    }

    /// Accumulate another turn's usage. Costs never go negative.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.response_cost += other.response_cost.max(0.0);
    }
}
