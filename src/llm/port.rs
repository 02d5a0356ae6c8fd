//! The request/response envelope between adapters and providers.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::Provider;
use crate::env::EnvSnapshot;
use crate::error::AgentError;
use crate::schema::Usage;

/// One provider round-trip, payload already in the provider's native shape.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider: Provider,
    /// Model name without the provider prefix.
    pub model: String,
    /// Provider-native JSON body, built by the adapter.
    pub payload: Value,
    /// Per-turn timeout.
    pub timeout: Duration,
}

impl ProviderRequest {
    pub fn new(provider: Provider, model: impl Into<String>, payload: Value) -> Self {
        Self {
            provider,
            model: model.into(),
            payload,
            timeout: Duration::from_secs(120),
        }
    }
}

/// The provider's raw response plus normalized usage.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub payload: Value,
    pub usage: Usage,
}

/// Chat-style access to a language model provider.
///
/// Implementations may pool connections internally; callers treat them as
/// shared and read-only. Tests swap in a scripted fake.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn chat(
        &self,
        req: ProviderRequest,
        env: &EnvSnapshot,
    ) -> Result<ProviderResponse, AgentError>;
}
