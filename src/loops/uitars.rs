//! UI-TARS box-token adapter.
//!
//! UI-TARS-family models answer in a `Thought: ... \n Action: ...` text
//! format where coordinates appear as box tokens, either special tokens
//! (`<|loc_512|><|loc_400|>`) or tuple notation (`(512,400)`). Token space is
//! 0..=1000 on both axes and must be scaled to the live display size.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use super::{
    latest_screenshot_b64, rewindow_images, to_data_url, AgentLoop, Capability, ClickPrediction,
    StepOutput, TurnInput,
};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, ProviderRequest, SimpleModel};
use crate::schema::{Action, CallStatus, ContentPart, Message, MouseButton, Point};

const TOKEN_SPACE: f64 = 1000.0;

fn loc_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\|loc_(\d+)\|>").expect("static regex"))
}

fn tuple_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\s*,\s*(\d+)\)").expect("static regex"))
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)Action:\s*(\w+)\((.*)\)\s*$").expect("static regex"))
}

fn arg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // key='value' with either quote style
    RE.get_or_init(|| Regex::new(r"(\w+)\s*=\s*'([^']*)'|(\w+)\s*=\s*\x22([^\x22]*)\x22").expect("static regex"))
}

/// Adapter for UI-TARS checkpoints served locally.
pub struct UiTarsLoop {
    model: SimpleModel,
    port: Arc<dyn LlmPort>,
}

impl UiTarsLoop {
    pub fn new(model: SimpleModel, port: Arc<dyn LlmPort>) -> Self {
        Self { model, port }
    }

    fn system_prompt() -> &'static str {
        "You are a GUI agent. You are given a task and a screenshot of the screen. \
         Reply in the format:\n\
         Thought: <your reasoning>\n\
         Action: <one of click(start_box='<|loc_x|><|loc_y|>'), \
         left_double(start_box='...'), right_single(start_box='...'), \
         drag(start_box='...', end_box='...'), hotkey(key='ctrl c'), \
         type(content='...'), scroll(start_box='...', direction='down'), \
         wait(), finished(content='<summary>')>"
    }

    /// Pull the first coordinate pair out of a box expression, in token
    /// space.
    fn parse_box(text: &str) -> Option<(f64, f64)> {
        let tokens: Vec<f64> = loc_token_re()
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<f64>().ok())
            .collect();
        if tokens.len() >= 2 {
            return Some((tokens[0], tokens[1]));
        }
        let caps = tuple_re().captures(text)?;
        Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
    }

    /// Token space → pixel space for the current display.
    fn scale(point: (f64, f64), dims: (u32, u32)) -> (i64, i64) {
        let x = (point.0 / TOKEN_SPACE * dims.0 as f64).round() as i64;
        let y = (point.1 / TOKEN_SPACE * dims.1 as f64).round() as i64;
        (
            x.clamp(0, dims.0 as i64 - 1),
            y.clamp(0, dims.1 as i64 - 1),
        )
    }

    fn parse_args(raw: &str) -> Vec<(String, String)> {
        arg_re()
            .captures_iter(raw)
            .map(|c| {
                let key = c.get(1).or_else(|| c.get(3)).map(|m| m.as_str()).unwrap_or("");
                let value = c.get(2).or_else(|| c.get(4)).map(|m| m.as_str()).unwrap_or("");
                (key.to_string(), value.to_string())
            })
            .collect()
    }

    fn decode_text(text: &str, dims: (u32, u32)) -> Result<Vec<Message>, AgentError> {
        let mut out = Vec::new();

        if let Some(thought) = text
            .split("Action:")
            .next()
            .and_then(|head| head.split("Thought:").nth(1))
        {
            let thought = thought.trim();
            if !thought.is_empty() {
                out.push(Message::Reasoning {
                    summary: vec![ContentPart::SummaryText {
                        text: thought.to_string(),
                    }],
                });
            }
        }

        let caps = action_re().captures(text.trim()).ok_or_else(|| {
            AgentError::Target(format!("no Action line in model output: {text:.120}"))
        })?;
        let verb = &caps[1];
        let args = Self::parse_args(&caps[2]);
        let arg = |key: &str| -> Option<&str> {
            args.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
        };
        let boxed = |key: &str| -> Result<(i64, i64), AgentError> {
            arg(key)
                .and_then(Self::parse_box)
                .map(|p| Self::scale(p, dims))
                .ok_or_else(|| {
                    AgentError::Target(format!("action {verb} missing {key} coordinates"))
                })
        };

        let action = match verb {
            "click" | "left_single" => {
                let (x, y) = boxed("start_box")?;
                Some(Action::Click {
                    button: MouseButton::Left,
                    x,
                    y,
                })
            }
            "right_single" => {
                let (x, y) = boxed("start_box")?;
                Some(Action::Click {
                    button: MouseButton::Right,
                    x,
                    y,
                })
            }
            "left_double" => {
                let (x, y) = boxed("start_box")?;
                Some(Action::DoubleClick {
                    button: MouseButton::Left,
                    x,
                    y,
                })
            }
            "drag" => {
                let (sx, sy) = boxed("start_box")?;
                let (ex, ey) = boxed("end_box")?;
                Some(Action::Drag {
                    button: MouseButton::Left,
                    path: vec![Point { x: sx, y: sy }, Point { x: ex, y: ey }],
                })
            }
            "hotkey" => Some(Action::Keypress {
                keys: arg("key")
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(|k| k.to_string())
                    .collect(),
            }),
            "type" => Some(Action::TypeText {
                text: arg("content").unwrap_or_default().to_string(),
            }),
            "scroll" => {
                let (x, y) = boxed("start_box")?;
                let delta = 5;
                let (scroll_x, scroll_y) = match arg("direction").unwrap_or("down") {
                    "up" => (0, -delta),
                    "left" => (-delta, 0),
                    "right" => (delta, 0),
                    _ => (0, delta),
                };
                Some(Action::Scroll {
                    x,
                    y,
                    scroll_x,
                    scroll_y,
                })
            }
            "wait" => Some(Action::Wait),
            "screenshot" => Some(Action::Screenshot),
            "finished" => {
                let summary = arg("content").unwrap_or("Task complete.").to_string();
                out.push(Message::assistant_text(summary));
                None
            }
            other => {
                return Err(AgentError::Target(format!(
                    "unsupported UI-TARS action: {other}"
                )))
            }
        };

        if let Some(action) = action {
            action.validate()?;
            out.push(Message::ComputerCall {
                call_id: format!("call_{}", Uuid::new_v4().simple()),
                status: CallStatus::Completed,
                action,
                pending_safety_checks: vec![],
            });
        }
        Ok(out)
    }

    fn user_goal(messages: &[Message]) -> String {
        messages
            .iter()
            .find_map(|m| match m {
                Message::User { content } => content.as_text().map(|t| t.to_string()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentLoop for UiTarsLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Step, Capability::Click]
    }

    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        let messages = rewindow_images(turn.messages, turn.image_retention_window);

        let mut content = vec![json!({
            "type": "text",
            "text": format!("Task: {}", Self::user_goal(&messages)),
        })];
        if let Some(b64) = latest_screenshot_b64(&messages) {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": to_data_url(&b64) },
            }));
        }

        let payload = json!({
            "model": self.model.name,
            "messages": [
                json!({ "role": "system", "content": Self::system_prompt() }),
                json!({ "role": "user", "content": content }),
            ],
            "max_tokens": 512,
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
            messages: Self::decode_text(text, turn.dims)?,
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
            "model": self.model.name,
            "messages": [json!({
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": to_data_url(image_b64) } },
                    {
                        "type": "text",
                        "text": format!(
                            "Output only: Action: click(start_box='<|loc_x|><|loc_y|>') \
                             for the target: {instruction}"
                        ),
                    },
                ],
            })],
            "max_tokens": 64,
        });

        let req = ProviderRequest::new(self.model.provider, self.model.name.clone(), payload);
        let response = self.port.chat(req, env).await?;

        let point = response.payload["choices"][0]["message"]["content"]
            .as_str()
            .and_then(Self::parse_box)
            .map(|p| Self::scale(p, dims));

        Ok(ClickPrediction {
            point,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: (u32, u32) = (1920, 1080);

    #[test]
    fn parses_loc_tokens_and_scales() {
        let out = UiTarsLoop::decode_text(
            "Thought: the button is near the middle\nAction: click(start_box='<|loc_500|><|loc_500|>')",
            DIMS,
        )
        .unwrap();
        assert!(matches!(out[0], Message::Reasoning { .. }));
        match &out[1] {
            Message::ComputerCall { action, .. } => assert_eq!(
                *action,
                Action::Click {
                    button: MouseButton::Left,
                    x: 960,
                    y: 540
                }
            ),
            other => panic!("expected computer_call, got {other:?}"),
        }
    }

    #[test]
    fn parses_tuple_notation() {
        let out =
            UiTarsLoop::decode_text("Action: left_double(start_box='(250,100)')", DIMS).unwrap();
        match &out[0] {
            Message::ComputerCall { action, .. } => assert_eq!(
                *action,
                Action::DoubleClick {
                    button: MouseButton::Left,
                    x: 480,
                    y: 108
                }
            ),
            other => panic!("expected computer_call, got {other:?}"),
        }
    }

    #[test]
    fn finished_yields_terminal_assistant() {
        let out = UiTarsLoop::decode_text(
            "Thought: nothing left\nAction: finished(content='opened the settings')",
            DIMS,
        )
        .unwrap();
        assert!(matches!(out.last().unwrap(), Message::Assistant { .. }));
    }

    #[test]
    fn hotkey_and_type_actions() {
        let out = UiTarsLoop::decode_text("Action: hotkey(key='ctrl shift t')", DIMS).unwrap();
        match &out[0] {
            Message::ComputerCall { action, .. } => assert_eq!(
                *action,
                Action::Keypress {
                    keys: vec!["ctrl".into(), "shift".into(), "t".into()]
                }
            ),
            other => panic!("expected keypress, got {other:?}"),
        }

        let out = UiTarsLoop::decode_text("Action: type(content='hello world')", DIMS).unwrap();
        assert!(matches!(
            &out[0],
            Message::ComputerCall {
                action: Action::TypeText { .. },
                ..
            }
        ));
    }

    #[test]
    fn missing_action_line_is_a_target_error() {
        let err = UiTarsLoop::decode_text("I will click the icon now", DIMS).unwrap_err();
        assert!(matches!(err, AgentError::Target(_)));
    }
}
