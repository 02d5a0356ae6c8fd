//! Agent loop adapters: one per model family.
//!
//! An adapter maps a single turn (conversation + display geometry) to one
//! provider round-trip and decodes the result back into canonical messages.
//! Adapters never touch the computer port; they only describe actions.

mod anthropic;
mod composite;
mod human;
mod omniparser;
mod openai;
mod uitars;
mod vlm;

pub use anthropic::AnthropicLoop;
pub use composite::CompositeLoop;
pub use human::{HumanDecision, HumanInbox, HumanLoop};
pub use omniparser::OmniparserLoop;
pub use openai::OpenAiLoop;
pub use uitars::UiTarsLoop;
pub use vlm::VlmLoop;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::computer::OsType;
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, ModelSpec, Provider, SimpleModel};
use crate::schema::{ContentPart, Message, Usage, SYNTHETIC_SCREENSHOT_URL};

/// What an adapter can do: drive full steps, predict clicks, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Step,
    Click,
}

/// Everything an adapter may look at for one turn.
pub struct TurnInput<'a> {
    pub messages: &'a [Message],
    /// Display size of the bound computer, in pixels.
    pub dims: (u32, u32),
    pub os_type: OsType,
    pub env: &'a EnvSnapshot,
    /// Keep at most this many screenshots expanded when building the
    /// provider request.
    pub image_retention_window: Option<usize>,
    /// Per-turn LLM timeout.
    pub timeout: Duration,
}

/// Canonical messages produced by one turn, plus that turn's usage.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub messages: Vec<Message>,
    pub usage: Usage,
}

/// Result of a grounding request.
#[derive(Debug, Clone, Default)]
pub struct ClickPrediction {
    pub point: Option<(i64, i64)>,
    pub usage: Usage,
}

/// A provider-family adapter. Canonical messages in, canonical messages out.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    fn capabilities(&self) -> &'static [Capability];

    /// One provider round-trip for the given turn.
    async fn step(&self, turn: TurnInput<'_>) -> Result<StepOutput, AgentError>;

    /// Locate a target on a screenshot. Grounders implement this; planners
    /// keep the default.
    async fn predict_click(
        &self,
        env: &EnvSnapshot,
        image_b64: &str,
        instruction: &str,
        dims: (u32, u32),
    ) -> Result<ClickPrediction, AgentError> {
        let _ = (env, image_b64, instruction, dims);
        Ok(ClickPrediction::default())
    }
}

/// Resolve a parsed model string to an adapter.
///
/// Composites resolve both halves and wrap them in [`CompositeLoop`]. The
/// `human` adapter needs an externally attached decision channel and is
/// constructed directly via [`HumanLoop::new`]; resolving it here without one
/// is a configuration error.
pub fn resolve(
    spec: &ModelSpec,
    port: Arc<dyn LlmPort>,
) -> Result<Box<dyn AgentLoop>, AgentError> {
    match &spec.grounder {
        None => resolve_simple(&spec.planner, port),
        Some(grounder) => {
            let planner = resolve_simple(&spec.planner, Arc::clone(&port))?;
            let grounder = resolve_simple(grounder, port)?;
            if !grounder.capabilities().contains(&Capability::Click) {
                return Err(AgentError::UnknownModel(format!(
                    "{}: grounder side cannot predict clicks",
                    spec.raw
                )));
            }
            Ok(Box::new(CompositeLoop::new(planner, grounder)))
        }
    }
}

fn resolve_simple(
    model: &SimpleModel,
    port: Arc<dyn LlmPort>,
) -> Result<Box<dyn AgentLoop>, AgentError> {
    let is_uitars = {
        let lower = model.name.to_ascii_lowercase();
        lower.contains("ui-tars") || lower.contains("uitars")
    };
    match model.provider {
        Provider::OpenAi if model.name.contains("computer-use-preview") => {
            Ok(Box::new(OpenAiLoop::new(model.name.clone(), port)))
        }
        Provider::Anthropic => Ok(Box::new(AnthropicLoop::new(model.name.clone(), port))),
        Provider::Omniparser => Ok(Box::new(OmniparserLoop::new(port))),
        Provider::Human => Err(AgentError::Config(
            "the human adapter requires an attached decision channel".to_string(),
        )),
        Provider::HuggingFaceLocal | Provider::Mlx if is_uitars => {
            Ok(Box::new(UiTarsLoop::new(model.clone(), port)))
        }
        Provider::OpenAi | Provider::HuggingFaceLocal | Provider::OllamaChat | Provider::Mlx => {
            Ok(Box::new(VlmLoop::new(model.clone(), port)))
        }
    }
}

/// Re-window a conversation so at most `window` screenshots stay expanded.
///
/// Older `computer_call_output` images are collapsed to a placeholder rather
/// than dropped, so call/output pairing survives. `None` keeps everything.
pub fn rewindow_images(messages: &[Message], window: Option<usize>) -> Vec<Message> {
    let Some(window) = window else {
        return messages.to_vec();
    };

    let expanded: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter_map(|(idx, msg)| match msg {
            Message::ComputerCallOutput { output, .. } => match output.image_url() {
                Some(url) if url != SYNTHETIC_SCREENSHOT_URL => Some(idx),
                _ => None,
            },
            _ => None,
        })
        .collect();

    if expanded.len() <= window {
        return messages.to_vec();
    }

    let cutoff = expanded[expanded.len() - window];
    messages
        .iter()
        .enumerate()
        .map(|(idx, msg)| match msg {
            Message::ComputerCallOutput {
                call_id,
                output,
                acknowledged_safety_checks,
            } if idx < cutoff && output.image_url().is_some() => Message::ComputerCallOutput {
                call_id: call_id.clone(),
                output: ContentPart::ComputerScreenshot {
                    image_url: SYNTHETIC_SCREENSHOT_URL.to_string(),
                },
                acknowledged_safety_checks: acknowledged_safety_checks.clone(),
            },
            other => other.clone(),
        })
        .collect()
}

/// Count screenshots that still carry real pixel data.
pub fn expanded_image_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|msg| match msg {
            Message::ComputerCallOutput { output, .. } => {
                matches!(output.image_url(), Some(url) if url != SYNTHETIC_SCREENSHOT_URL)
            }
            _ => false,
        })
        .count()
}

/// The most recent screenshot in history, as bare base64: the latest
/// `computer_call_output` image, else the latest user `input_image`.
pub fn latest_screenshot_b64(messages: &[Message]) -> Option<String> {
    let url = messages.iter().rev().find_map(|msg| match msg {
        Message::ComputerCallOutput { output, .. } => match output.image_url() {
            Some(url) if url != SYNTHETIC_SCREENSHOT_URL => Some(url.to_string()),
            _ => None,
        },
        Message::User {
            content: crate::schema::UserContent::Parts(parts),
        } => parts.iter().rev().find_map(|p| match p {
            ContentPart::InputImage { image_url } => Some(image_url.clone()),
            _ => None,
        }),
        _ => None,
    })?;
    Some(strip_data_url(&url).to_string())
}

/// Drop a `data:image/...;base64,` prefix if present.
pub fn strip_data_url(url: &str) -> &str {
    match url.split_once(";base64,") {
        Some((_, data)) => data,
        None => url,
    }
}

/// Wrap bare base64 PNG data as a data URL.
pub fn to_data_url(b64: &str) -> String {
    if b64.starts_with("data:") || b64.starts_with("http") {
        b64.to_string()
    } else {
        format!("data:image/png;base64,{b64}")
    }
}
