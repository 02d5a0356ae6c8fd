//! OpenAI computer-use adapter (Responses API).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    rewindow_images, to_data_url, AgentLoop, Capability, ClickPrediction, StepOutput, TurnInput,
};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, Provider, ProviderRequest};
use crate::schema::{Message, UserContent};

/// Adapter for `openai/*computer-use-preview*` models.
///
/// Threads `previous_response_id` across turns within a run: once a response
/// id is known, only the items produced since that response (screenshot
/// outputs, fresh user messages) are sent.
pub struct OpenAiLoop {
    model: String,
    port: Arc<dyn LlmPort>,
    previous_response_id: Mutex<Option<String>>,
}

impl OpenAiLoop {
    pub fn new(model: String, port: Arc<dyn LlmPort>) -> Self {
        Self {
            model,
            port,
            previous_response_id: Mutex::new(None),
        }
    }

    fn computer_tool(dims: (u32, u32), os_type: crate::computer::OsType) -> Value {
        json!({
            "type": "computer_use_preview",
            "display_width": dims.0,
            "display_height": dims.1,
            "environment": os_type.environment(),
        })
    }

    /// Encode canonical messages as Responses API input items. Reasoning
    /// items are trace-only and not resent.
    fn encode_items(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                Message::User { content } => Some(json!({
                    "role": "user",
                    "content": match content {
                        UserContent::Text(text) => json!(text),
                        UserContent::Parts(parts) => serde_json::to_value(parts).unwrap_or_default(),
                    },
                })),
                Message::Assistant { content } => Some(json!({
                    "role": "assistant",
                    "content": serde_json::to_value(content).unwrap_or_default(),
                })),
                Message::Reasoning { .. } => None,
                other => serde_json::to_value(other).ok(),
            })
            .collect()
    }

    /// Items the model has not seen yet: the trailing run of outputs and
    /// user messages after its last own item.
    fn trailing_feedback(messages: &[Message]) -> &[Message] {
        let mut start = messages.len();
        for (idx, msg) in messages.iter().enumerate().rev() {
            match msg {
                Message::ComputerCallOutput { .. }
                | Message::FunctionCallOutput { .. }
                | Message::User { .. } => start = idx,
                _ => break,
            }
        }
        &messages[start..]
    }

    fn decode_items(items: &[Value]) -> Vec<Message> {
        let mut canonical = Vec::new();
        for item in items {
            let mapped = match item["type"].as_str() {
                Some("message") => {
                    let role = item["role"].as_str().unwrap_or("assistant");
                    json!({ "type": role, "content": item["content"] })
                }
                _ => item.clone(),
            };
            canonical.push(mapped);
        }
        Message::decode_lenient(canonical)
    }
}

#[async_trait]
impl AgentLoop for OpenAiLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step, Capability::Click]
    }

    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let messages = rewindow_images(turn.messages, turn.image_retention_window);

        let previous = self.previous_response_id.lock().await.clone();
        let input = match &previous {
            Some(_) => Self::encode_items(Self::trailing_feedback(&messages)),
            None => Self::encode_items(&messages),
        };

        let mut payload = json!({
            "model": self.model,
            "input": input,
            "tools": [Self::computer_tool(turn.dims, turn.os_type)],
            "reasoning": { "summary": "concise" },
            "truncation": "auto",
        });
        if let Some(id) = previous {
            payload["previous_response_id"] = json!(id);
        }

        let mut req = ProviderRequest::new(Provider::OpenAi, self.model.clone(), payload);
        req.timeout = turn.timeout;
        let response = self.port.chat(req, turn.env).await?;

        if let Some(id) = response.payload["id"].as_str() {
            *self.previous_response_id.lock().await = Some(id.to_string());
        }

        let items = response.payload["output"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let decoded = Self::decode_items(&items);
        if decoded.is_empty() {
            return Err(AgentError::Target(
                "provider response contained no decodable output items".to_string(),
            ));
        }

        Ok(StepOutput {
            messages: decoded,
            usage: response.usage,
        })
    }

    async fn predict_click(
        &self,
        env: &EnvSnapshot,
        image_b64: &str,
        instruction: &str,
        dims: (u32, u32),
    ) -> Result<ClickPrediction, AgentError> {
        let payload = json!({
            "model": self.model,
            "input": [
                {
                    "role": "user",
                    "content": format!(
                        "You are a UI grounding expert. Output ONLY a click action on the \
                         target element. Target: {instruction}"
                    ),
                },
                {
                    "role": "user",
                    "content": [
                        { "type": "input_image", "image_url": to_data_url(image_b64) }
                    ],
                },
            ],
            "tools": [json!({
                "type": "computer_use_preview",
                "display_width": dims.0,
                "display_height": dims.1,
                "environment": "linux",
            })],
            "truncation": "auto",
            "max_output_tokens": 200,
        });

        let req = ProviderRequest::new(Provider::OpenAi, self.model.clone(), payload);
        let response = self.port.chat(req, env).await?;

        let point = response.payload["output"]
            .as_array()
            .into_iter()
            .flatten()
            .find_map(|item| {
                if item["type"].as_str() != Some("computer_call") {
                    return None;
                }
                let action = &item["action"];
                Some((action["x"].as_i64()?, action["y"].as_i64()?))
            });

        Ok(ClickPrediction {
            point,
            usage: response.usage,
        })
    }
}
