//! Per-model USD pricing for cost accounting.
//!
//! Prices are USD per million tokens. Models without an entry contribute
//! zero cost and mark the session's `pricingKnown` flag false, so consumers
//! never mistake a partial total for a complete one.

use crate::config::{ModelConfig, Provider};

/// USD per million prompt / completion tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub prompt_per_mtok: f64,
    pub completion_per_mtok: f64,
}

/// Known pricing, keyed by model-name prefix.
///
/// Local and mock providers are free by definition.
const PRICING: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o-mini",
        ModelPricing {
            prompt_per_mtok: 0.15,
            completion_per_mtok: 0.60,
        },
    ),
    (
        "gpt-4o",
        ModelPricing {
            prompt_per_mtok: 2.50,
            completion_per_mtok: 10.00,
        },
    ),
    (
        "gpt-4.1-mini",
        ModelPricing {
            prompt_per_mtok: 0.40,
            completion_per_mtok: 1.60,
        },
    ),
    (
        "gpt-4.1",
        ModelPricing {
            prompt_per_mtok: 2.00,
            completion_per_mtok: 8.00,
        },
    ),
    (
        "claude-opus",
        ModelPricing {
            prompt_per_mtok: 15.00,
            completion_per_mtok: 75.00,
        },
    ),
    (
        "claude-sonnet",
        ModelPricing {
            prompt_per_mtok: 3.00,
            completion_per_mtok: 15.00,
        },
    ),
    (
        "claude-haiku",
        ModelPricing {
            prompt_per_mtok: 0.80,
            completion_per_mtok: 4.00,
        },
    ),
];

/// Look up pricing for a model configuration.
///
/// Longest-prefix match on the model name so versioned names
/// (`gpt-4o-2024-11-20`) resolve to their family entry.
pub fn pricing_for(model: &ModelConfig) -> Option<ModelPricing> {
    match model.provider {
        Provider::Mock | Provider::Cli => Some(ModelPricing {
            prompt_per_mtok: 0.0,
            completion_per_mtok: 0.0,
        }),
        Provider::Openai => PRICING
            .iter()
            .filter(|(prefix, _)| model.model.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| *p),
    }
}

/// Cost of one call in USD, with a flag for whether pricing was known.
pub fn call_cost(model: &ModelConfig, prompt_tokens: u64, completion_tokens: u64) -> (f64, bool) {
    match pricing_for(model) {
        Some(p) => {
            let cost = prompt_tokens as f64 / 1_000_000.0 * p.prompt_per_mtok
                + completion_tokens as f64 / 1_000_000.0 * p.completion_per_mtok;
            (cost, true)
        }
        None => (0.0, false),
    }
}
