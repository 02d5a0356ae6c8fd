//! Canonical message and content-part types.

use serde::{Deserialize, Serialize};

use super::Action;
use crate::error::AgentError;

/// Placeholder screenshot used when a real one cannot exist: skipped actions,
/// cancellation after a call was emitted, retention-trimmed history. A 1x1
/// transparent PNG data URL.
pub const SYNTHETIC_SCREENSHOT_URL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Completion status on call items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Completed,
    InProgress,
}

/// A provider-side safety check attached to a computer call. Echoed back
/// unchanged on the next request; policy belongs to callbacks, not adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputImage { image_url: String },
    OutputText { text: String },
    SummaryText { text: String },
    ComputerScreenshot { image_url: String },
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::InputText { text }
            | ContentPart::OutputText { text }
            | ContentPart::SummaryText { text } => Some(text),
            _ => None,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            ContentPart::InputImage { image_url } | ContentPart::ComputerScreenshot { image_url } => {
                Some(image_url)
            }
            _ => None,
        }
    }
}

/// User message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl UserContent {
    /// Flatten to the text of the first text-bearing part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            UserContent::Text(text) => Some(text),
            UserContent::Parts(parts) => parts.iter().find_map(|p| p.text()),
        }
    }
}

/// A canonical message. Immutable once emitted; retained in the trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<ContentPart>,
    },
    /// Model-visible thinking, surfaced for UI traces.
    Reasoning {
        summary: Vec<ContentPart>,
    },
    ComputerCall {
        call_id: String,
        status: CallStatus,
        action: Action,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pending_safety_checks: Vec<SafetyCheck>,
    },
    ComputerCallOutput {
        call_id: String,
        output: ContentPart,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        acknowledged_safety_checks: Vec<SafetyCheck>,
    },
    FunctionCall {
        call_id: String,
        status: CallStatus,
        name: String,
        /// JSON-encoded arguments, kept as a string like the providers do.
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl Message {
    /// A user message holding plain text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User {
            content: UserContent::Text(text.into()),
        }
    }

    /// An assistant message holding a single `output_text` part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant {
            content: vec![ContentPart::OutputText { text: text.into() }],
        }
    }

    /// A screenshot output bound to an earlier call.
    pub fn screenshot_output(call_id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Message::ComputerCallOutput {
            call_id: call_id.into(),
            output: ContentPart::ComputerScreenshot {
                image_url: image_url.into(),
            },
            acknowledged_safety_checks: Vec::new(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::ComputerCall { call_id, .. }
            | Message::ComputerCallOutput { call_id, .. }
            | Message::FunctionCall { call_id, .. }
            | Message::FunctionCallOutput { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Strict decode, for the HTTP trust boundary. Unknown variants reject.
    pub fn decode(value: serde_json::Value) -> Result<Message, AgentError> {
        serde_json::from_value(value)
            .map_err(|e| AgentError::Target(format!("invalid canonical message: {e}")))
    }

    /// Lenient decode for trusted adapter output: items that do not parse as
    /// canonical messages are skipped with a warning.
    pub fn decode_lenient(values: Vec<serde_json::Value>) -> Vec<Message> {
        values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<Message>(v.clone()) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::warn!(error = %e, item = %v, "skipping non-canonical item");
                    None
                }
            })
            .collect()
    }

    /// Validate required shapes for this message and any embedded action.
    pub fn validate(&self) -> Result<(), AgentError> {
        match self {
            Message::ComputerCall { action, call_id, .. } => {
                if call_id.is_empty() {
                    return Err(AgentError::Target(
                        "computer_call requires a call_id".to_string(),
                    ));
                }
                action.validate()
            }
            Message::ComputerCallOutput { call_id, output, .. } => {
                if call_id.is_empty() {
                    return Err(AgentError::Target(
                        "computer_call_output requires a call_id".to_string(),
                    ));
                }
                match output {
                    ContentPart::ComputerScreenshot { .. } => Ok(()),
                    _ => Err(AgentError::Target(
                        "computer_call_output must carry a computer_screenshot".to_string(),
                    )),
                }
            }
            Message::FunctionCall { name, .. } if name.is_empty() => Err(AgentError::Target(
                "function_call requires a name".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Whether a slice of messages ends a run: the trailing message is an
/// assistant message with no later call item.
pub fn is_terminal(messages: &[Message]) -> bool {
    for msg in messages.iter().rev() {
        match msg {
            Message::ComputerCall { .. } | Message::FunctionCall { .. } => return false,
            Message::Assistant { .. } => return true,
            _ => continue,
        }
    }
    false
}
