//! Run error taxonomy with retry classification.
//!
//! Distinguishes transient errors (retried with back-off) from fatal errors,
//! and carries the clean-termination cases (budget, step limit, cancellation)
//! as ordinary variants so the orchestrator can map them to a run status
//! instead of bubbling them to the proxy as failures.

use serde::{Deserialize, Serialize};

/// Error raised anywhere inside a run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// No adapter resolves the model string. Fatal to the run.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Missing API key, incompatible computer spec, bad wiring. Fatal before
    /// any LLM call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure, 5xx, socket error. Retried with back-off.
    #[error("transport error: {0}")]
    Transport(String),

    /// 4xx from a provider, parse failure, schema validation failure. Passed
    /// to `on_error`; fatal if no callback recovers.
    #[error("target error: {0}")]
    Target(String),

    /// A `function_call` named a tool no registry knows. Surfaced as a
    /// target-class error so callbacks may recover.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Cooperative cancellation. Terminal non-error.
    #[error("cancelled")]
    Cancelled,

    /// Accumulated `response_cost` crossed the trajectory budget.
    #[error("trajectory budget exceeded: spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded { spent: f64, limit: f64 },

    /// The ASK/ACT loop ran `max_steps` times.
    #[error("step limit reached after {0} steps")]
    StepLimitReached(usize),

    /// The computer pool could not satisfy an acquire within its timeout.
    #[error("computer pool exhausted")]
    PoolExhausted,
}

impl AgentError {
    /// Whether this error should be retried with back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transport(_))
    }

    /// Whether this error ends the run cleanly (`status=completed`) rather
    /// than as a failure.
    pub fn is_clean_termination(&self) -> bool {
        matches!(
            self,
            AgentError::BudgetExceeded { .. } | AgentError::StepLimitReached(_)
        )
    }

    /// Classify an HTTP status from a provider into the taxonomy.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        match status {
            429 => AgentError::Transport(detail),
            500..=599 => AgentError::Transport(detail),
            _ => AgentError::Target(detail),
        }
    }
}

/// Terminal status of a run. Exactly one is emitted per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}
