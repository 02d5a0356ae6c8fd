//! Model-string grammar.
//!
//! ```text
//! model    := simple | simple "+" simple
//! simple   := provider "/" name ("/" name)*
//! ```
//!
//! A `+` forms a composite (planner+grounder). The grounder-only
//! `omniparser` provider is treated as the grounder side regardless of which
//! side of the `+` it is written on.

use crate::error::AgentError;

/// Provider prefixes the core recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    HuggingFaceLocal,
    OllamaChat,
    Mlx,
    Omniparser,
    Human,
}

impl Provider {
    pub fn parse(prefix: &str) -> Option<Provider> {
        match prefix {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "huggingface-local" => Some(Provider::HuggingFaceLocal),
            "ollama_chat" => Some(Provider::OllamaChat),
            "mlx" => Some(Provider::Mlx),
            "omniparser" => Some(Provider::Omniparser),
            "human" => Some(Provider::Human),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::HuggingFaceLocal => "huggingface-local",
            Provider::OllamaChat => "ollama_chat",
            Provider::Mlx => "mlx",
            Provider::Omniparser => "omniparser",
            Provider::Human => "human",
        }
    }

    /// Environment variable holding this provider's API key, if it needs one.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            _ => None,
        }
    }
}

/// One `provider/name` half of a model string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimpleModel {
    pub provider: Provider,
    /// Everything after the provider prefix. Empty for provider-only strings
    /// such as `omniparser` and `human`.
    pub name: String,
}

impl SimpleModel {
    pub fn parse(s: &str) -> Result<SimpleModel, AgentError> {
        let (prefix, name) = match s.split_once('/') {
            Some((prefix, rest)) => (prefix, rest),
            None => (s, ""),
        };
        let provider = Provider::parse(prefix)
            .ok_or_else(|| AgentError::UnknownModel(s.to_string()))?;
        Ok(SimpleModel {
            provider,
            name: name.to_string(),
        })
    }

    /// The full provider-prefixed string, as pricing tables key it.
    pub fn qualified(&self) -> String {
        if self.name.is_empty() {
            self.provider.as_str().to_string()
        } else {
            format!("{}/{}", self.provider.as_str(), self.name)
        }
    }
}

/// A parsed model string: a single adapter, or a planner+grounder pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub raw: String,
    pub planner: SimpleModel,
    pub grounder: Option<SimpleModel>,
}

impl ModelSpec {
    pub fn parse(raw: &str) -> Result<ModelSpec, AgentError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AgentError::UnknownModel("(empty)".to_string()));
        }
        let parts: Vec<&str> = raw.split('+').collect();
        match parts.as_slice() {
            [single] => Ok(ModelSpec {
                raw: raw.to_string(),
                planner: SimpleModel::parse(single)?,
                grounder: None,
            }),
            [first, second] => {
                let a = SimpleModel::parse(first)?;
                let b = SimpleModel::parse(second)?;
                // The grounder-only provider grounds no matter the spelling.
                let (planner, grounder) = if a.provider == Provider::Omniparser {
                    (b, a)
                } else {
                    (a, b)
                };
                Ok(ModelSpec {
                    raw: raw.to_string(),
                    planner,
                    grounder: Some(grounder),
                })
            }
            _ => Err(AgentError::UnknownModel(format!(
                "{raw}: at most one '+' is allowed"
            ))),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.grounder.is_some()
    }
}
