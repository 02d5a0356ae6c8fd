//! Set-of-Marks grounder backed by an OmniParser detection service.
//!
//! The service takes a screenshot and returns labeled UI elements with
//! normalized bounding boxes. Grounding picks the element whose label best
//! matches the intent and clicks its center. This adapter only grounds; it
//! is always the grounder side of a composite.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{AgentLoop, Capability, ClickPrediction, StepOutput, TurnInput};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::llm::{LlmPort, Provider, ProviderRequest};

/// One detected UI element. Boxes are `[x1, y1, x2, y2]` normalized to 0..1.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectedElement {
    pub bbox: [f64; 4],
    #[serde(default, alias = "label")]
    pub content: String,
}

impl DetectedElement {
    fn center(&self, dims: (u32, u32)) -> (i64, i64) {
        let cx = (self.bbox[0] + self.bbox[2]) / 2.0 * dims.0 as f64;
        let cy = (self.bbox[1] + self.bbox[3]) / 2.0 * dims.1 as f64;
        (cx.round() as i64, cy.round() as i64)
    }
}

pub struct OmniparserLoop {
    port: Arc<dyn LlmPort>,
}

impl OmniparserLoop {
    pub fn new(port: Arc<dyn LlmPort>) -> Self {
        Self { port }
    }

    /// Score how well an element label matches the intent: the fraction of
    /// intent words found in the label, with an exact-substring bonus.
    fn score(intent: &str, label: &str) -> f64 {
        let intent_lower = intent.to_lowercase();
        let label_lower = label.to_lowercase();
        if label_lower.is_empty() {
            return 0.0;
        }
        if label_lower.contains(intent_lower.trim()) || intent_lower.contains(label_lower.trim()) {
            return 1.0;
        }
        let words: Vec<&str> = intent_lower
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .collect();
        if words.is_empty() {
            return 0.0;
        }
        let hits = words.iter().filter(|w| label_lower.contains(**w)).count();
        hits as f64 / words.len() as f64
    }

    fn best_match(intent: &str, elements: &[DetectedElement]) -> Option<usize> {
        let (best, score) = elements
            .iter()
            .enumerate()
            .map(|(idx, el)| (idx, Self::score(intent, &el.content)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        (score > 0.0).then_some(best)
    }
}

#[async_trait]
impl AgentLoop for OmniparserLoop {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Click]
    }

    async fn step(&self, _turn: TurnInput<'_>) -> Result<StepOutput, AgentError> {
        Err(AgentError::Target(
            "omniparser is a grounder-only model; pair it with a planner".to_string(),
        ))
    }

    async fn predict_click(
        &self,
        env: &EnvSnapshot,
        image_b64: &str,
        instruction: &str,
        dims: (u32, u32),
    ) -> Result<ClickPrediction, AgentError> {
        let req = ProviderRequest::new(
            Provider::Omniparser,
            "omniparser",
            json!({ "image_b64": image_b64 }),
        );
        let response = self.port.chat(req, env).await?;

        let elements: Vec<DetectedElement> =
            serde_json::from_value(response.payload["elements"].clone()).map_err(|e| {
                AgentError::Target(format!("invalid omniparser element list: {e}"))
            })?;

        tracing::debug!(count = elements.len(), intent = instruction, "grounding over detected elements");

        let point = Self::best_match(instruction, &elements)
            .map(|idx| elements[idx].center(dims));

        Ok(ClickPrediction {
            point,
            usage: response.usage,
        })
    }
}
