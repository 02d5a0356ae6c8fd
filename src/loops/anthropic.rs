//! Anthropic computer-use adapter (Messages API, tool use).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    rewindow_images, strip_data_url, AgentLoop, Capability, ClickPrediction, StepOutput, TurnInput,
};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, Provider, ProviderRequest};
use crate::schema::{Action, CallStatus, ContentPart, Message, MouseButton, Point, UserContent};

const COMPUTER_TOOL_TYPE: &str = "computer_20250124";
const MAX_TOKENS: u64 = 4096;

/// Adapter for `anthropic/*` models.
pub struct AnthropicLoop {
    model: String,
    port: Arc<dyn LlmPort>,
}

impl AnthropicLoop {
    pub fn new(model: String, port: Arc<dyn LlmPort>) -> Self {
        Self { model, port }
    }

    fn image_block(url: &str) -> Value {
        json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": "image/png",
                "data": strip_data_url(url),
            },
        })
    }

    fn part_blocks(parts: &[ContentPart]) -> Vec<Value> {
        parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::InputText { text }
                | ContentPart::OutputText { text }
                | ContentPart::SummaryText { text } => Some(json!({ "type": "text", "text": text })),
                ContentPart::InputImage { image_url }
                | ContentPart::ComputerScreenshot { image_url } => Some(Self::image_block(image_url)),
            })
            .collect()
    }

    /// Encode the canonical action in the `computer` tool's input shape.
    fn encode_action(action: &Action) -> Value {
        match action {
            Action::Click { button, x, y } => {
                let name = match button {
                    MouseButton::Left => "left_click",
                    MouseButton::Right => "right_click",
                    MouseButton::Wheel => "middle_click",
                    MouseButton::Back | MouseButton::Forward => "left_click",
                };
                json!({ "action": name, "coordinate": [x, y] })
            }
            Action::DoubleClick { x, y, .. } => {
                json!({ "action": "double_click", "coordinate": [x, y] })
            }
            Action::Drag { path, .. } => {
                let start = path.first().copied().unwrap_or(Point { x: 0, y: 0 });
                let end = path.last().copied().unwrap_or(start);
                json!({
                    "action": "left_click_drag",
                    "start_coordinate": [start.x, start.y],
                    "coordinate": [end.x, end.y],
                })
            }
            Action::Move { x, y } => json!({ "action": "mouse_move", "coordinate": [x, y] }),
            Action::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => {
                let (direction, amount) = if scroll_y.abs() >= scroll_x.abs() {
                    (if *scroll_y > 0 { "down" } else { "up" }, scroll_y.abs())
                } else {
                    (if *scroll_x > 0 { "right" } else { "left" }, scroll_x.abs())
                };
                json!({
                    "action": "scroll",
                    "coordinate": [x, y],
                    "scroll_direction": direction,
                    "scroll_amount": amount,
                })
            }
            Action::Keypress { keys } => json!({ "action": "key", "text": keys.join("+") }),
            Action::TypeText { text } => json!({ "action": "type", "text": text }),
            Action::Screenshot => json!({ "action": "screenshot" }),
            Action::Wait => json!({ "action": "wait", "duration": 1 }),
            Action::LeftMouseDown { x, y } => {
                json!({ "action": "left_mouse_down", "coordinate": [x, y] })
            }
            Action::LeftMouseUp { x, y } => {
                json!({ "action": "left_mouse_up", "coordinate": [x, y] })
            }
        }
    }

    /// Decode a `computer` tool_use input into the canonical action.
    fn decode_action(input: &Value) -> Result<Action, AgentError> {
        let coordinate = |value: &Value| -> (i64, i64) {
            (
                value[0].as_i64().unwrap_or(0),
                value[1].as_i64().unwrap_or(0),
            )
        };
        let action = input["action"]
            .as_str()
            .ok_or_else(|| AgentError::Target("tool_use input missing action".to_string()))?;
        let decoded = match action {
            "left_click" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::Click {
                    button: MouseButton::Left,
                    x,
                    y,
                }
            }
            "right_click" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::Click {
                    button: MouseButton::Right,
                    x,
                    y,
                }
            }
            "middle_click" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::Click {
                    button: MouseButton::Wheel,
                    x,
                    y,
                }
            }
            "double_click" | "triple_click" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::DoubleClick {
                    button: MouseButton::Left,
                    x,
                    y,
                }
            }
            "mouse_move" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::Move { x, y }
            }
            "left_click_drag" => {
                let (sx, sy) = coordinate(&input["start_coordinate"]);
                let (ex, ey) = coordinate(&input["coordinate"]);
                Action::Drag {
                    button: MouseButton::Left,
                    path: vec![Point { x: sx, y: sy }, Point { x: ex, y: ey }],
                }
            }
            "left_mouse_down" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::LeftMouseDown { x, y }
            }
            "left_mouse_up" => {
                let (x, y) = coordinate(&input["coordinate"]);
                Action::LeftMouseUp { x, y }
            }
            "scroll" | "hscroll" => {
                let (x, y) = coordinate(&input["coordinate"]);
                let amount = input["scroll_amount"].as_i64().unwrap_or(3);
                let (scroll_x, scroll_y) = match input["scroll_direction"].as_str() {
                    Some("up") => (0, -amount),
                    Some("left") => (-amount, 0),
                    Some("right") => (amount, 0),
                    _ => (0, amount),
                };
                Action::Scroll {
                    x,
                    y,
                    scroll_x,
                    scroll_y,
                }
            }
            "key" => Action::Keypress {
                keys: input["text"]
                    .as_str()
                    .unwrap_or_default()
                    .split('+')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect(),
            },
            "type" => Action::TypeText {
                text: input["text"].as_str().unwrap_or_default().to_string(),
            },
            "screenshot" => Action::Screenshot,
            "wait" => Action::Wait,
            other => {
                return Err(AgentError::Target(format!(
                    "unsupported computer action: {other}"
                )))
            }
        };
        Ok(decoded)
    }

    /// Fold canonical messages into alternating-role Anthropic messages.
    fn encode_messages(messages: &[Message]) -> Vec<Value> {
        let mut out: Vec<(String, Vec<Value>)> = Vec::new();
        let mut push = |role: &str, block: Value| match out.last_mut() {
            Some((last_role, blocks)) if last_role == role => blocks.push(block),
            _ => out.push((role.to_string(), vec![block])),
        };

        for msg in messages {
            match msg {
                Message::User { content } => match content {
                    UserContent::Text(text) => {
                        push("user", json!({ "type": "text", "text": text }))
                    }
                    UserContent::Parts(parts) => {
                        for block in Self::part_blocks(parts) {
                            push("user", block);
                        }
                    }
                },
                Message::Assistant { content } => {
                    for block in Self::part_blocks(content) {
                        push("assistant", block);
                    }
                }
                // Thinking blocks need provider signatures to be resent;
                // they stay in the trajectory only.
                Message::Reasoning { .. } => {}
                Message::ComputerCall {
                    call_id, action, ..
                } => push(
                    "assistant",
                    json!({
                        "type": "tool_use",
                        "id": call_id,
                        "name": "computer",
                        "input": Self::encode_action(action),
                    }),
                ),
                Message::ComputerCallOutput {
                    call_id, output, ..
                } => {
                    let content = match output.image_url() {
                        Some(url) => json!([Self::image_block(url)]),
                        None => json!([]),
                    };
                    push(
                        "user",
                        json!({
                            "type": "tool_result",
                            "tool_use_id": call_id,
                            "content": content,
                        }),
                    );
                }
                Message::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                } => {
                    let input: Value =
                        serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                    push(
                        "assistant",
                        json!({
                            "type": "tool_use",
                            "id": call_id,
                            "name": name,
                            "input": input,
                        }),
                    );
                }
                Message::FunctionCallOutput { call_id, output } => push(
                    "user",
                    json!({
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": output,
                    }),
                ),
            }
        }

        out.into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect()
    }

    fn decode_content(&self, blocks: &[Value]) -> Vec<Message> {
        let mut out = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    let text = block["text"].as_str().unwrap_or_default().to_string();
                    out.push(Message::assistant_text(text));
                }
                Some("thinking") => {
                    let text = block["thinking"].as_str().unwrap_or_default().to_string();
                    out.push(Message::Reasoning {
                        summary: vec![ContentPart::SummaryText { text }],
                    });
                }
                Some("tool_use") => {
                    let call_id = block["id"]
                        .as_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
                    let name = block["name"].as_str().unwrap_or_default();
                    if name == "computer" {
                        match Self::decode_action(&block["input"]) {
                            Ok(action) => out.push(Message::ComputerCall {
                                call_id,
                                status: CallStatus::Completed,
                                action,
                                pending_safety_checks: vec![],
                            }),
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping undecodable tool_use block")
                            }
                        }
                    } else {
                        out.push(Message::FunctionCall {
                            call_id,
                            status: CallStatus::Completed,
                            name: name.to_string(),
                            arguments: block["input"].to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[async_trait]
impl AgentLoop for AnthropicLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step, Capability::Click]
    }

    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let messages = rewindow_images(turn.messages, turn.image_retention_window);

        let payload = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": Self::encode_messages(&messages),
            "tools": [json!({
                "type": COMPUTER_TOOL_TYPE,
                "name": "computer",
                "display_width_px": turn.dims.0,
                "display_height_px": turn.dims.1,
                "display_number": 1,
            })],
        });

        let mut req = ProviderRequest::new(Provider::Anthropic, self.model.clone(), payload);
        req.timeout = turn.timeout;
        let response = self.port.chat(req, turn.env).await?;

        let blocks = response.payload["content"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let decoded = self.decode_content(&blocks);
        if decoded.is_empty() {
            return Err(AgentError::Target(
                "provider response contained no content blocks".to_string(),
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
            "max_tokens": 256,
            "messages": [json!({
                "role": "user",
                "content": [
                    Self::image_block(image_b64),
                    json!({
                        "type": "text",
                        "text": format!(
                            "Click {instruction}. Use the computer tool to output exactly \
                             one left_click on the target element."
                        ),
                    }),
                ],
            })],
            "tools": [json!({
                "type": COMPUTER_TOOL_TYPE,
                "name": "computer",
                "display_width_px": dims.0,
                "display_height_px": dims.1,
                "display_number": 1,
            })],
        });

        let req = ProviderRequest::new(Provider::Anthropic, self.model.clone(), payload);
        let response = self.port.chat(req, env).await?;

        let point = response.payload["content"]
            .as_array()
            .into_iter()
            .flatten()
            .find_map(|block| {
                if block["type"].as_str() != Some("tool_use") {
                    return None;
                }
                let coordinate = &block["input"]["coordinate"];
                Some((coordinate[0].as_i64()?, coordinate[1].as_i64()?))
            });

        Ok(ClickPrediction {
            point,
            usage: response.usage,
        })
    }
}
