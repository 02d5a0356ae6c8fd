//! Exponential back-off with jitter.

use rand::Rng;
use std::time::Duration;

/// Retry schedule for transient failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    /// Fractional jitter: delays are scaled by a factor in `1 ± jitter`.
    pub jitter: f64,
    pub cap: Duration,
    /// Total attempts, including the first.
    pub max_tries: u32,
}

impl Backoff {
    /// Policy for LLM-port transport errors.
    pub fn llm() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.25,
            cap: Duration::from_secs(8),
            max_tries: 4,
        }
    }

    /// Policy for computer-port transport errors.
    pub fn computer() -> Self {
        Self {
            max_tries: 2,
            ..Self::llm()
        }
    }

    /// Delay before retry number `attempt` (0-based: the delay after the
    /// first failure is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let scale = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * scale).min(self.cap.as_secs_f64()))
    }
}
