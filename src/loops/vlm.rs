//! Generic vision-language adapter for chat-completions-style models.
//!
//! Works with any model that can look at a screenshot and emit a strict JSON
//! object `{"action": {...}, "reasoning": "...", "done": bool}`. Output
//! parsing is deliberately forgiving: code fences and trailing prose are
//! tolerated, and a parse failure degrades to a `noop` function call so the
//! orchestrator's error machinery decides what happens next.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    latest_screenshot_b64, rewindow_images, to_data_url, AgentLoop, Capability, ClickPrediction,
    StepOutput, TurnInput,
};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, ProviderRequest, SimpleModel};
use crate::schema::{Action, CallStatus, ContentPart, Message};

/// Adapter for plain chat VLMs addressed as `openai/...`, `ollama_chat/...`,
/// `huggingface-local/...` or `mlx/...`.
pub struct VlmLoop {
    model: SimpleModel,
    port: Arc<dyn LlmPort>,
}

impl VlmLoop {
    pub fn new(model: SimpleModel, port: Arc<dyn LlmPort>) -> Self {
        Self { model, port }
    }

    fn system_prompt(dims: (u32, u32)) -> String {
        format!(
            "You control a computer with a {}x{} pixel screen by emitting one JSON object \
             per turn and nothing else.\n\
             Schema: {{\"action\": <action>, \"reasoning\": \"<short why>\", \"done\": <bool>}}\n\
             Actions: {{\"type\":\"click\",\"button\":\"left\",\"x\":X,\"y\":Y}}, \
             {{\"type\":\"double_click\",\"x\":X,\"y\":Y}}, \
             {{\"type\":\"type\",\"text\":\"...\"}}, \
             {{\"type\":\"keypress\",\"keys\":[\"ctrl\",\"s\"]}}, \
             {{\"type\":\"scroll\",\"x\":X,\"y\":Y,\"scroll_x\":DX,\"scroll_y\":DY}}, \
             {{\"type\":\"move\",\"x\":X,\"y\":Y}}, \
             {{\"type\":\"screenshot\"}}, {{\"type\":\"wait\"}}.\n\
             Coordinates are integer pixels from the top-left corner. \
             When the task is finished, set \"done\": true, omit \"action\", and put a \
             summary in \"reasoning\".",
            dims.0, dims.1
        )
    }

    /// Flatten canonical history into chat messages. Only the most recent
    /// screenshot is attached as an image; older ones become text markers.
    fn encode_messages(messages: &[Message], dims: (u32, u32)) -> Vec<Value> {
        let mut chat = vec![json!({ "role": "system", "content": Self::system_prompt(dims) })];
        let last_image = latest_screenshot_b64(messages);

        for msg in messages {
            match msg {
                Message::User { content } => {
                    let text = content.as_text().unwrap_or_default();
                    if !text.is_empty() {
                        chat.push(json!({ "role": "user", "content": text }));
                    }
                }
                Message::Assistant { content } => {
                    let text: String = content
                        .iter()
                        .filter_map(|p| p.text())
                        .collect::<Vec<_>>()
                        .join("\n");
                    chat.push(json!({ "role": "assistant", "content": text }));
                }
                Message::Reasoning { .. } => {}
                Message::ComputerCall { action, .. } => {
                    chat.push(json!({
                        "role": "assistant",
                        "content": json!({ "action": action }).to_string(),
                    }));
                }
                Message::ComputerCallOutput { output, .. } => {
                    let is_last = output.image_url().map(super::strip_data_url)
                        == last_image.as_deref();
                    if is_last {
                        if let Some(url) = output.image_url() {
                            chat.push(json!({
                                "role": "user",
                                "content": [{
                                    "type": "image_url",
                                    "image_url": { "url": to_data_url(url) },
                                }],
                            }));
                        }
                    } else {
                        chat.push(json!({ "role": "user", "content": "[screenshot taken]" }));
                    }
                }
                Message::FunctionCall { name, arguments, .. } => {
                    chat.push(json!({
                        "role": "assistant",
                        "content": format!("[called {name}({arguments})]"),
                    }));
                }
                Message::FunctionCallOutput { output, .. } => {
                    chat.push(json!({ "role": "user", "content": output.clone() }));
                }
            }
        }
        chat
    }

    /// Find and parse the JSON object in model text. Accepts code-fenced
    /// output and surrounding prose.
    fn extract_json(text: &str) -> Option<Value> {
        let trimmed = text.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Some(value);
        }
        // Code fence: take what's between the first pair of ``` markers.
        if let Some(start) = trimmed.find("```") {
            let inner = &trimmed[start + 3..];
            let inner = inner.strip_prefix("json").unwrap_or(inner);
            if let Some(end) = inner.find("```") {
                if let Ok(value) = serde_json::from_str::<Value>(inner[..end].trim()) {
                    return Some(value);
                }
            }
        }
        // Last resort: first '{' to last '}'.
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&trimmed[start..=end]).ok()
    }

    fn decode_text(text: &str) -> Vec<Message> {
        let Some(parsed) = Self::extract_json(text) else {
            return vec![Message::FunctionCall {
                call_id: format!("call_{}", Uuid::new_v4().simple()),
                status: CallStatus::Completed,
                name: "noop".to_string(),
                arguments: json!({ "error": "unparseable model output", "raw": text })
                    .to_string(),
            }];
        };

        let mut out = Vec::new();
        if let Some(reasoning) = parsed["reasoning"].as_str() {
            if !reasoning.is_empty() {
                out.push(Message::Reasoning {
                    summary: vec![ContentPart::SummaryText {
                        text: reasoning.to_string(),
                    }],
                });
            }
        }

        let done = parsed["done"].as_bool().unwrap_or(false);
        let action = parsed.get("action").filter(|a| !a.is_null());

        match action {
            Some(raw) if !done => match serde_json::from_value::<Action>(raw.clone()) {
                Ok(action) => out.push(Message::ComputerCall {
                    call_id: format!("call_{}", Uuid::new_v4().simple()),
                    status: CallStatus::Completed,
                    action,
                    pending_safety_checks: vec![],
                }),
                Err(e) => out.push(Message::FunctionCall {
                    call_id: format!("call_{}", Uuid::new_v4().simple()),
                    status: CallStatus::Completed,
                    name: "noop".to_string(),
                    arguments: json!({ "error": format!("invalid action: {e}"), "raw": raw })
                        .to_string(),
                }),
            },
            _ => {
                let summary = parsed["reasoning"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("Task complete.");
                out.push(Message::assistant_text(summary));
            }
        }
        out
    }
}

#[async_trait]
impl AgentLoop for VlmLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step, Capability::Click]
    }

    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let messages = rewindow_images(turn.messages, turn.image_retention_window);

        let payload = json!({
            "model": self.model.name,
            "messages": Self::encode_messages(&messages, turn.dims),
            "max_tokens": 1024,
        });

        let mut req = ProviderRequest::new(self.model.provider, self.model.name.clone(), payload);
        req.timeout = turn.timeout;
        let response = self.port.chat(req, turn.env).await?;

        let text = response.payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                AgentError::Target("chat response missing message content".to_string())
            })?;

        Ok(StepOutput {
            messages: Self::decode_text(text),
            usage: response.usage,
        })
    }

    async fn predict_click(
        &self,
        env: &EnvSnapshot,
        image_b64: &str,
        instruction: &str,
        _dims: (u32, u32),
    ) -> Result<ClickPrediction, AgentError> {
        let prompt = format!(
            "Localize an element on the GUI image according to the provided target and output \
             a click position. You must output a valid JSON following the format: \
             {{\"action\": \"click_absolute\", \"x\": <int>, \"y\": <int>}} \
             Your target is: {instruction}"
        );
        let payload = json!({
            "model": self.model.name,
            "messages": [json!({
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": to_data_url(image_b64) } },
                    { "type": "text", "text": prompt },
                ],
            })],
            "max_tokens": 128,
        });

        let req = ProviderRequest::new(self.model.provider, self.model.name.clone(), payload);
        let response = self.port.chat(req, env).await?;

        let point = response.payload["choices"][0]["message"]["content"]
            .as_str()
            .and_then(Self::extract_json)
            .and_then(|v| Some((v["x"].as_i64()?, v["y"].as_i64()?)));

        Ok(ClickPrediction {
            point,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MouseButton;

    #[test]
    fn parses_bare_json() {
        let out = VlmLoop::decode_text(r#"{"action":{"type":"click","x":10,"y":20},"reasoning":"go"}"#);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Message::Reasoning { .. }));
        match &out[1] {
            Message::ComputerCall { action, .. } => assert_eq!(
                *action,
                Action::Click {
                    button: MouseButton::Left,
                    x: 10,
                    y: 20
                }
            ),
            other => panic!("expected computer_call, got {other:?}"),
        }
    }

    #[test]
    fn parses_code_fenced_json_with_prose() {
        let text = "Sure, here's the action:\n```json\n{\"action\":{\"type\":\"wait\"}}\n```\nLet me know.";
        let out = VlmLoop::decode_text(text);
        assert!(out
            .iter()
            .any(|m| matches!(m, Message::ComputerCall { action: Action::Wait, .. })));
    }

    #[test]
    fn done_flag_produces_terminal_assistant() {
        let out = VlmLoop::decode_text(r#"{"done": true, "reasoning": "all set"}"#);
        assert_eq!(out.len(), 2);
        assert!(matches!(out.last().unwrap(), Message::Assistant { .. }));
    }

    #[test]
    fn unparseable_output_becomes_noop_function_call() {
        let out = VlmLoop::decode_text("I would suggest clicking somewhere in the middle");
        assert_eq!(out.len(), 1);
        match &out[0] {
            Message::FunctionCall { name, arguments, .. } => {
                assert_eq!(name, "noop");
                assert!(arguments.contains("unparseable"));
            }
            other => panic!("expected noop function_call, got {other:?}"),
        }
    }

    #[test]
    fn invalid_action_shape_becomes_noop() {
        let out = VlmLoop::decode_text(r#"{"action":{"type":"hover","x":1}}"#);
        assert!(matches!(&out[0], Message::FunctionCall { name, .. } if name == "noop"));
    }
}
