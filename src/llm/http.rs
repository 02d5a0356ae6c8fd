//! Production `LlmPort` over HTTP.

use async_trait::async_trait;
use serde_json::Value;

use super::{pricing, LlmPort, Provider, ProviderRequest, ProviderResponse};
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::schema::Usage;

const OPENAI_BASE: &str = "https://api.openai.com";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OLLAMA_BASE: &str = "http://localhost:11434";
const HF_LOCAL_BASE: &str = "http://localhost:8080";
const MLX_BASE: &str = "http://localhost:8081";
const OMNIPARSER_BASE: &str = "http://localhost:7860";

/// HTTP client for every recognized provider endpoint.
pub struct HttpLlm {
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(provider: Provider, env: &EnvSnapshot) -> Result<String, AgentError> {
        let url = match provider {
            Provider::OpenAi => format!(
                "{}/v1/responses",
                env.get("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_BASE.to_string())
            ),
            Provider::Anthropic => format!(
                "{}/v1/messages",
                env.get("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|| ANTHROPIC_BASE.to_string())
            ),
            Provider::OllamaChat => format!(
                "{}/v1/chat/completions",
                env.get("OLLAMA_BASE_URL").unwrap_or_else(|| OLLAMA_BASE.to_string())
            ),
            Provider::HuggingFaceLocal => format!(
                "{}/v1/chat/completions",
                env.get("HF_LOCAL_BASE_URL")
                    .unwrap_or_else(|| HF_LOCAL_BASE.to_string())
            ),
            Provider::Mlx => format!(
                "{}/v1/chat/completions",
                env.get("MLX_BASE_URL").unwrap_or_else(|| MLX_BASE.to_string())
            ),
            Provider::Omniparser => format!(
                "{}/parse",
                env.get("OMNIPARSER_URL").unwrap_or_else(|| OMNIPARSER_BASE.to_string())
            ),
            Provider::Human => {
                return Err(AgentError::Config(
                    "the human adapter has no HTTP endpoint".to_string(),
                ))
            }
        };
        Ok(url)
    }

    /// Pull token counts out of a provider response body. OpenAI-style bodies
    /// use `prompt_tokens`/`completion_tokens`, Anthropic-style bodies use
    /// `input_tokens`/`output_tokens`.
    fn extract_usage(model: &str, payload: &Value) -> Usage {
        let usage = &payload["usage"];
        let prompt = usage["prompt_tokens"]
            .as_u64()
            .or_else(|| usage["input_tokens"].as_u64())
            .unwrap_or(0);
        let completion = usage["completion_tokens"]
            .as_u64()
            .or_else(|| usage["output_tokens"].as_u64())
            .unwrap_or(0);
        let mut out = Usage::new(prompt, completion);
        if let Some(total) = usage["total_tokens"].as_u64() {
            out.total_tokens = total;
        }
        out.response_cost = usage["response_cost"]
            .as_f64()
            .unwrap_or_else(|| pricing::cost(model, &out));
        out
    }
}

impl Default for HttpLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmPort for HttpLlm {
    async fn chat(
        &self,
        req: ProviderRequest,
        env: &EnvSnapshot,
    ) -> Result<ProviderResponse, AgentError> {
        let url = Self::endpoint(req.provider, env)?;
        let mut request = self
            .client
            .post(&url)
            .timeout(req.timeout)
            .json(&req.payload);

        match req.provider {
            Provider::OpenAi => {
                let key = env.require("OPENAI_API_KEY")?;
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            Provider::Anthropic => {
                let key = env.require("ANTHROPIC_API_KEY")?;
                request = request
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
            }
            _ => {}
        }

        tracing::debug!(provider = req.provider.as_str(), model = %req.model, %url, "llm request");

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(format!("{url}: {e}")))?;

        if !status.is_success() {
            return Err(AgentError::from_http_status(status.as_u16(), &body));
        }

        let payload: Value = serde_json::from_str(&body).map_err(|e| {
            AgentError::Target(format!("unparseable provider response: {e}"))
        })?;

        let qualified = format!("{}/{}", req.provider.as_str(), req.model);
        let usage = Self::extract_usage(&qualified, &payload);

        tracing::debug!(
            provider = req.provider.as_str(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost = usage.response_cost,
            "llm response"
        );

        Ok(ProviderResponse { payload, usage })
    }
}
