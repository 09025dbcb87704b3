//! Per-model price table.
//!
//! Prices are USD per million tokens. Unknown models price at zero; the
//! platform treats locally-hosted models as free until a pricing source
//! exists for them.

use crate::domain::models::TokenUsage;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Known model prices.
pub fn price_for(model: &str) -> Option<ModelPricing> {
    // Match on family prefixes so dated snapshot names resolve too.
    let table: &[(&str, ModelPricing)] = &[
        ("claude-opus-4", ModelPricing { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
        ("claude-sonnet-4", ModelPricing { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
        ("claude-haiku-4", ModelPricing { input_per_mtok: 1.0, output_per_mtok: 5.0 }),
        ("claude-3-5-sonnet", ModelPricing { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
        ("claude-3-5-haiku", ModelPricing { input_per_mtok: 0.8, output_per_mtok: 4.0 }),
    ];

    table
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, pricing)| *pricing)
}

/// Monetary cost of one call. Unknown models cost 0.
#[allow(clippy::cast_precision_loss)]
pub fn cost_of(model: &str, usage: TokenUsage) -> f64 {
    price_for(model).map_or(0.0, |p| {
        (usage.input_tokens as f64 / 1_000_000.0) * p.input_per_mtok
            + (usage.output_tokens as f64 / 1_000_000.0) * p.output_per_mtok
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let usage = TokenUsage { input_tokens: 1_000_000, output_tokens: 1_000_000 };
        let cost = cost_of("claude-sonnet-4-5-20250929", usage);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_free() {
        let usage = TokenUsage { input_tokens: 1_000_000, output_tokens: 1_000_000 };
        assert_eq!(cost_of("llama-local", usage), 0.0);
    }
}
