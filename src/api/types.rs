//! Proxy request and response types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::computer::ComputerSpec;
use crate::env::EnvSnapshot;
use crate::error::{AgentError, RunStatus};
use crate::schema::{Message, Usage};
use crate::session::RunRequest;

/// Body of `POST /responses` (and of one peer data-channel message).
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: InputPayload,
    #[serde(default)]
    pub agent_kwargs: AgentKwargs,
    #[serde(default)]
    pub computer_kwargs: ComputerSpec,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Task input: a plain instruction or a full canonical conversation.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputPayload {
    Text(String),
    Messages(Vec<serde_json::Value>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentKwargs {
    #[serde(default)]
    pub save_trajectory: Option<bool>,
    #[serde(default)]
    pub trajectory_dir: Option<String>,
    #[serde(default)]
    pub max_trajectory_budget: Option<f64>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub image_retention_window: Option<usize>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of every `/responses` reply.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsesResponse {
    pub output: Vec<Message>,
    pub usage: Usage,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsesResponse {
    /// A failure that happened before any run state existed.
    pub fn rejected(err: &AgentError) -> Self {
        Self {
            output: Vec::new(),
            usage: Usage::default(),
            status: RunStatus::Failed,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

impl ResponsesRequest {
    /// Validate at the trust boundary and lower into the manager's request
    /// shape. Unknown message variants are rejected here, not skipped.
    pub fn into_run_request(
        self,
        header_session_id: Option<String>,
        default_trajectory_dir: &std::path::Path,
    ) -> Result<RunRequest, AgentError> {
        let input = match self.input {
            InputPayload::Text(text) => {
                if text.trim().is_empty() {
                    return Err(AgentError::Target("input must not be empty".to_string()));
                }
                vec![Message::user_text(text)]
            }
            InputPayload::Messages(values) => {
                if values.is_empty() {
                    return Err(AgentError::Target("input must not be empty".to_string()));
                }
                let mut messages = Vec::with_capacity(values.len());
                for value in values {
                    let msg = Message::decode(value)?;
                    msg.validate()?;
                    messages.push(msg);
                }
                messages
            }
        };

        let trajectory_dir = match self.agent_kwargs.save_trajectory {
            Some(true) => Some(
                self.agent_kwargs
                    .trajectory_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| default_trajectory_dir.to_path_buf()),
            ),
            _ => self.agent_kwargs.trajectory_dir.map(PathBuf::from),
        };

        Ok(RunRequest {
            model: self.model,
            input,
            session_id: self.agent_kwargs.session_id.or(header_session_id),
            computer_spec: self.computer_kwargs,
            env: EnvSnapshot::with_overrides(self.env),
            max_steps: self.agent_kwargs.max_steps,
            max_trajectory_budget: self.agent_kwargs.max_trajectory_budget,
            image_retention_window: self.agent_kwargs.image_retention_window,
            trajectory_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ResponsesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn string_input_becomes_a_user_message() {
        let req = parse(json!({
            "model": "anthropic/claude-3-5-sonnet-20241022",
            "input": "open the settings",
        }));
        let run = req
            .into_run_request(None, std::path::Path::new("trajectories"))
            .unwrap();
        assert_eq!(run.input.len(), 1);
        assert!(matches!(run.input[0], Message::User { .. }));
        assert!(run.trajectory_dir.is_none());
    }

    #[test]
    fn canonical_message_input_is_validated_strictly() {
        let req = parse(json!({
            "model": "openai/computer-use-preview",
            "input": [{ "type": "telepathy", "content": "?" }],
        }));
        assert!(req
            .into_run_request(None, std::path::Path::new("trajectories"))
            .is_err());
    }

    #[test]
    fn header_session_id_is_a_fallback_only() {
        let req = parse(json!({
            "model": "openai/computer-use-preview",
            "input": "hello",
            "agent_kwargs": { "session_id": "from-body" },
        }));
        let run = req
            .into_run_request(Some("from-header".to_string()), std::path::Path::new("t"))
            .unwrap();
        assert_eq!(run.session_id.as_deref(), Some("from-body"));

        let req = parse(json!({
            "model": "openai/computer-use-preview",
            "input": "hello",
        }));
        let run = req
            .into_run_request(Some("from-header".to_string()), std::path::Path::new("t"))
            .unwrap();
        assert_eq!(run.session_id.as_deref(), Some("from-header"));
    }

    #[test]
    fn save_trajectory_uses_the_default_directory() {
        let req = parse(json!({
            "model": "openai/computer-use-preview",
            "input": "hello",
            "agent_kwargs": { "save_trajectory": true },
        }));
        let run = req
            .into_run_request(None, std::path::Path::new("/var/trajectories"))
            .unwrap();
        assert_eq!(
            run.trajectory_dir.as_deref(),
            Some(std::path::Path::new("/var/trajectories"))
        );
    }
}
