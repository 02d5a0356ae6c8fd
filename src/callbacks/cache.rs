//! Prompt-cache hints for providers that support them.

use async_trait::async_trait;
use serde_json::json;

use super::{Callback, RunContext};
use crate::llm::{Provider, ProviderRequest};

/// Marks the trailing K messages of an Anthropic request as cache-eligible
/// (`cache_control: ephemeral` on their last content block). Providers
/// without wire-level cache markers are left untouched.
pub struct PromptCacheHinter {
    last_k: usize,
}

impl PromptCacheHinter {
    pub fn new(last_k: usize) -> Self {
        Self { last_k }
    }
}

impl Default for PromptCacheHinter {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl Callback for PromptCacheHinter {
    async fn before_llm(&self, _ctx: &RunContext, mut req: ProviderRequest) -> ProviderRequest {
        if req.provider != Provider::Anthropic || self.last_k == 0 {
            return req;
        }
        if let Some(messages) = req.payload["messages"].as_array_mut() {
            let len = messages.len();
            let from = len.saturating_sub(self.last_k);
            for message in &mut messages[from..] {
                if let Some(last_block) = message["content"]
                    .as_array_mut()
                    .and_then(|blocks| blocks.last_mut())
                {
                    last_block["cache_control"] = json!({ "type": "ephemeral" });
                }
            }
        }
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            session_id: "s".to_string(),
            model: "m".to_string(),
        }
    }

    fn anthropic_request(message_count: usize) -> ProviderRequest {
        let messages: Vec<_> = (0..message_count)
            .map(|n| {
                json!({
                    "role": if n % 2 == 0 { "user" } else { "assistant" },
                    "content": [{ "type": "text", "text": format!("m{n}") }],
                })
            })
            .collect();
        ProviderRequest::new(
            Provider::Anthropic,
            "claude-3-5-sonnet-20241022",
            json!({ "messages": messages }),
        )
    }

    #[tokio::test]
    async fn marks_only_the_trailing_messages() {
        let req = PromptCacheHinter::new(2)
            .before_llm(&ctx(), anthropic_request(4))
            .await;
        let messages = req.payload["messages"].as_array().unwrap();
        assert!(messages[0]["content"][0]["cache_control"].is_null());
        assert!(messages[1]["content"][0]["cache_control"].is_null());
        assert_eq!(messages[2]["content"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(messages[3]["content"][0]["cache_control"]["type"], "ephemeral");
    }

    #[tokio::test]
    async fn leaves_other_providers_alone() {
        let req = ProviderRequest::new(Provider::OpenAi, "gpt-4o", json!({ "input": [] }));
        let out = PromptCacheHinter::new(2).before_llm(&ctx(), req).await;
        assert!(out.payload["messages"].is_null());
    }
}
