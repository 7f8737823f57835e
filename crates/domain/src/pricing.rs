//! Token cost estimation.
//!
//! Prices are USD per one million tokens. Lookup is by longest model-name
//! prefix so dated snapshots (`claude-sonnet-4-20250514`) resolve to their
//! family entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Fallback rate for models with no price entry: USD per 1K total tokens.
pub const FALLBACK_PER_1K_TOKENS: f64 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

const fn price(input_per_1m: f64, output_per_1m: f64) -> ModelPrice {
    ModelPrice {
        input_per_1m,
        output_per_1m,
    }
}

const BUILTIN: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", price(15.0, 75.0)),
    ("claude-sonnet-4", price(3.0, 15.0)),
    ("claude-3-7-sonnet", price(3.0, 15.0)),
    ("claude-3-5-sonnet", price(3.0, 15.0)),
    ("claude-3-5-haiku", price(0.8, 4.0)),
    ("claude-3-haiku", price(0.25, 1.25)),
    ("gpt-4o-mini", price(0.15, 0.6)),
    ("gpt-4o", price(2.5, 10.0)),
    ("gpt-4.1-mini", price(0.4, 1.6)),
    ("gpt-4.1-nano", price(0.1, 0.4)),
    ("gpt-4.1", price(2.0, 8.0)),
    ("gpt-4-turbo", price(10.0, 30.0)),
    ("gpt-3.5-turbo", price(0.5, 1.5)),
    ("o1-mini", price(1.1, 4.4)),
    ("o1", price(15.0, 60.0)),
    ("o3-mini", price(1.1, 4.4)),
    ("o3", price(2.0, 8.0)),
    ("o4-mini", price(1.1, 4.4)),
    ("gemini-2.5-pro", price(1.25, 10.0)),
    ("gemini-2.5-flash", price(0.3, 2.5)),
    ("gemini-2.0-flash", price(0.1, 0.4)),
    ("gemini-1.5-pro", price(1.25, 5.0)),
    ("gemini-1.5-flash", price(0.075, 0.3)),
    ("grok-3-mini", price(0.3, 0.5)),
    ("grok-3", price(3.0, 15.0)),
    ("grok-4", price(3.0, 15.0)),
    ("deepseek-chat", price(0.27, 1.1)),
    ("deepseek-reasoner", price(0.55, 2.19)),
];

/// Built-in prices plus config overrides.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    overrides: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(overrides: HashMap<String, ModelPrice>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { overrides }
    }

    /// Resolve the price for `model`, overrides first.
    pub fn lookup(&self, model: &str) -> Option<ModelPrice> {
        let m = model.to_ascii_lowercase();
        let m = m.rsplit('/').next().unwrap_or(&m);

        let from_overrides = self
            .overrides
            .iter()
            .filter(|(prefix, _)| m.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| *p);
        if from_overrides.is_some() {
            return from_overrides;
        }

        BUILTIN
            .iter()
            .filter(|(prefix, _)| m.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| *p)
    }

    pub fn cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        match self.lookup(model) {
            Some(p) => {
                (prompt_tokens as f64 * p.input_per_1m + completion_tokens as f64 * p.output_per_1m)
                    / 1_000_000.0
            }
            None => {
                (prompt_tokens as f64 + completion_tokens as f64) / 1000.0 * FALLBACK_PER_1K_TOKENS
            }
        }
    }
}

/// Estimate the USD cost of one completion using built-in prices only.
pub fn calculate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    PriceTable::default().cost(model, prompt_tokens, completion_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn unknown_model_uses_linear_fallback() {
        assert!(approx(calculate_cost("unknown-model-xyz", 1000, 1000), 0.004));
        assert!(approx(calculate_cost("unknown-model-xyz", 0, 0), 0.0));
    }

    #[test]
    fn longest_prefix_wins() {
        // gpt-4o-mini must not be priced as gpt-4o.
        let mini = calculate_cost("gpt-4o-mini-2024-07-18", 1_000_000, 0);
        assert!(approx(mini, 0.15));
        let full = calculate_cost("gpt-4o-2024-08-06", 1_000_000, 0);
        assert!(approx(full, 2.5));
    }

    #[test]
    fn provider_prefix_is_ignored() {
        assert!(approx(
            calculate_cost("anthropic/claude-sonnet-4-20250514", 0, 1_000_000),
            15.0
        ));
    }

    #[test]
    fn overrides_take_precedence() {
        let table = PriceTable::new(HashMap::from([(
            "GPT-4o".to_string(),
            ModelPrice {
                input_per_1m: 1.0,
                output_per_1m: 1.0,
            },
        )]));
        assert!(approx(table.cost("gpt-4o", 500_000, 500_000), 1.0));
        // Unrelated models still resolve from the built-in table.
        assert!(approx(table.cost("o3-mini", 1_000_000, 0), 1.1));
    }
}
