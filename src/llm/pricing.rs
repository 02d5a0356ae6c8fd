//! Static per-model pricing, used when the provider does not report a cost.
//!
//! Rates are dollars per million tokens. Unknown models cost zero rather
//! than failing the run; budget enforcement only needs a non-negative number.

use crate::schema::Usage;

/// `(prompt, completion)` dollars per 1M tokens for a qualified model string.
pub fn rates(model: &str) -> Option<(f64, f64)> {
    // Ordered from most to least specific; first substring match wins.
    const TABLE: &[(&str, f64, f64)] = &[
        ("computer-use-preview", 3.0, 12.0),
        ("gpt-4o-mini", 0.15, 0.60),
        ("gpt-4o", 2.50, 10.00),
        ("claude-3-5-sonnet", 3.00, 15.00),
        ("claude-3-7-sonnet", 3.00, 15.00),
        ("claude-sonnet-4", 3.00, 15.00),
        ("claude-3-5-haiku", 0.80, 4.00),
        ("claude-haiku", 0.80, 4.00),
        ("claude-opus", 15.00, 75.00),
    ];
    TABLE
        .iter()
        .find(|(needle, _, _)| model.contains(needle))
        .map(|(_, input, output)| (*input, *output))
}

/// Dollar cost of one response. Zero for unpriced (e.g. local) models.
pub fn cost(model: &str, usage: &Usage) -> f64 {
    match rates(model) {
        Some((input, output)) => {
            (usage.prompt_tokens as f64 * input + usage.completion_tokens as f64 * output)
                / 1_000_000.0
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_costs_are_positive() {
        let usage = Usage::new(1000, 500);
        let c = cost("openai/computer-use-preview", &usage);
        assert!(c > 0.0);
        // 1000 * 3 + 500 * 12 per million
        assert!((c - 0.009).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let usage = Usage::new(1000, 500);
        assert_eq!(cost("ollama_chat/llava", &usage), 0.0);
    }

    #[test]
    fn mini_matches_before_base_model() {
        let usage = Usage::new(1_000_000, 0);
        assert!((cost("openai/gpt-4o-mini", &usage) - 0.15).abs() < 1e-9);
        assert!((cost("openai/gpt-4o", &usage) - 2.50).abs() < 1e-9);
    }
}
