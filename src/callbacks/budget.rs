//! Dollar cap on a run's accumulated response cost.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Callback, RunContext};
use crate::error::AgentError;
use crate::loops::StepOutput;

/// Accumulates `response_cost` after every LLM call and raises
/// [`AgentError::BudgetExceeded`] once the cap is crossed. The orchestrator
/// turns that into a clean `completed` termination with a budget note; the
/// error is surfaced, never recovered.
pub struct BudgetCap {
    limit_usd: f64,
    spent: Mutex<f64>,
}

impl BudgetCap {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit_usd,
            spent: Mutex::new(0.0),
        }
    }

    pub async fn spent(&self) -> f64 {
        *self.spent.lock().await
    }
}

#[async_trait]
impl Callback for BudgetCap {
    async fn after_llm(
        &self,
        ctx: &RunContext,
        resp: StepOutput,
    ) -> Result<StepOutput, AgentError> {
        let mut spent = self.spent.lock().await;
        *spent += resp.usage.response_cost.max(0.0);
        if *spent > self.limit_usd {
            tracing::info!(
                run_id = %ctx.run_id,
                spent = *spent,
                limit = self.limit_usd,
                "trajectory budget exceeded"
            );
            return Err(AgentError::BudgetExceeded {
                spent: *spent,
                limit: self.limit_usd,
            });
        }
        Ok(resp)
    }
}
