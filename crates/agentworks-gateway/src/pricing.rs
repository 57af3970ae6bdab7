//! Model pricing - static cost table and platform markup
//!
//! Cost is computed once, at response time, from the table instance the
//! router was built with; historical billing records are never
//! re-derived against an updated table. Price is a fixed multiplicative
//! markup over cost, set at construction and never re-queried per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default cost per 1M input tokens (USD) for unknown models
pub const DEFAULT_INPUT_COST_PER_MILLION: f64 = 5.0;

/// Default cost per 1M output tokens (USD) for unknown models
pub const DEFAULT_OUTPUT_COST_PER_MILLION: f64 = 15.0;

/// Default platform markup: price = cost * markup
pub const DEFAULT_PRICE_MARKUP: f64 = 1.25;

// ============================================================================
// 2026 Model Pricing Constants (per 1M tokens, USD)
// ============================================================================

// OpenAI GPT-5 family (Aug 2025~)
/// GPT-5 nano input cost per 1M tokens
pub const GPT5_NANO_INPUT_COST: f64 = 0.05;
/// GPT-5 nano output cost per 1M tokens
pub const GPT5_NANO_OUTPUT_COST: f64 = 0.40;
/// GPT-5 input cost per 1M tokens
pub const GPT5_INPUT_COST: f64 = 1.25;
/// GPT-5 output cost per 1M tokens
pub const GPT5_OUTPUT_COST: f64 = 10.00;

// OpenAI GPT-4o family (legacy)
/// GPT-4o-mini input cost per 1M tokens
pub const GPT4O_MINI_INPUT_COST: f64 = 0.15;
/// GPT-4o-mini output cost per 1M tokens
pub const GPT4O_MINI_OUTPUT_COST: f64 = 0.60;
/// GPT-4o input cost per 1M tokens
pub const GPT4O_INPUT_COST: f64 = 2.50;
/// GPT-4o output cost per 1M tokens
pub const GPT4O_OUTPUT_COST: f64 = 10.00;

// Anthropic Claude 4.5 family
/// Claude Haiku 4.5 input cost per 1M tokens
pub const CLAUDE_HAIKU45_INPUT_COST: f64 = 1.00;
/// Claude Haiku 4.5 output cost per 1M tokens
pub const CLAUDE_HAIKU45_OUTPUT_COST: f64 = 5.00;
/// Claude Sonnet 4.5 input cost per 1M tokens
pub const CLAUDE_SONNET45_INPUT_COST: f64 = 3.00;
/// Claude Sonnet 4.5 output cost per 1M tokens
pub const CLAUDE_SONNET45_OUTPUT_COST: f64 = 15.00;
/// Claude Opus 4.5 input cost per 1M tokens
pub const CLAUDE_OPUS45_INPUT_COST: f64 = 5.00;
/// Claude Opus 4.5 output cost per 1M tokens
pub const CLAUDE_OPUS45_OUTPUT_COST: f64 = 25.00;

// Google Gemini 2.5 family
/// Gemini 2.5 Flash input cost per 1M tokens
pub const GEMINI_FLASH_INPUT_COST: f64 = 0.075;
/// Gemini 2.5 Flash output cost per 1M tokens
pub const GEMINI_FLASH_OUTPUT_COST: f64 = 0.60;
/// Gemini 2.5 Pro input cost per 1M tokens
pub const GEMINI_PRO_INPUT_COST: f64 = 1.25;
/// Gemini 2.5 Pro output cost per 1M tokens
pub const GEMINI_PRO_OUTPUT_COST: f64 = 15.00;

/// Pricing information for a model (per 1M tokens)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Model name
    pub model: String,
    /// Provider name
    pub provider: String,
    /// Cost per 1M input tokens (USD)
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens (USD)
    pub output_cost_per_million: f64,
    /// Context window size
    pub context_window: u32,
    /// Last updated
    pub updated_at: DateTime<Utc>,
}

impl ModelPricing {
    /// Calculate cost for given token counts
    #[must_use]
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million;
        input_cost + output_cost
    }
}

/// Pre-flight cost/price estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Platform cost (USD)
    pub cost: f64,
    /// Price charged to the workspace (USD)
    pub price: f64,
}

/// Static pricing table with a fixed platform markup
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    markup: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingTable {
    /// Create a table with the default model pricing and markup
    #[must_use]
    pub fn new() -> Self {
        Self {
            models: default_pricing(),
            markup: DEFAULT_PRICE_MARKUP,
        }
    }

    /// Set the platform markup
    #[must_use]
    pub fn with_markup(mut self, markup: f64) -> Self {
        self.markup = markup;
        self
    }

    /// Insert or replace pricing for a model
    pub fn insert(&mut self, pricing: ModelPricing) {
        self.models.insert(pricing.model.clone(), pricing);
    }

    /// Get pricing for a model
    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Cost in USD for a request against `model`
    ///
    /// Unknown models fall back to the default rates rather than
    /// billing as free.
    #[must_use]
    pub fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.models.get(model) {
            Some(pricing) => pricing.calculate_cost(input_tokens, output_tokens),
            None => {
                (input_tokens as f64 / 1_000_000.0) * DEFAULT_INPUT_COST_PER_MILLION
                    + (output_tokens as f64 / 1_000_000.0) * DEFAULT_OUTPUT_COST_PER_MILLION
            }
        }
    }

    /// Price charged to the workspace for a given cost
    #[must_use]
    pub fn price(&self, cost: f64) -> f64 {
        cost * self.markup
    }

    /// Pre-flight cost/price estimate for a request
    ///
    /// Deterministic: identical to the response-time computation for
    /// the same table instance and token counts.
    #[must_use]
    pub fn estimate(&self, model: &str, input_tokens: u32, output_tokens: u32) -> CostEstimate {
        let cost = self.cost(model, input_tokens, output_tokens);
        CostEstimate {
            cost,
            price: self.price(cost),
        }
    }
}

/// Default pricing for the routed model families (2026 pricing)
#[must_use]
pub fn default_pricing() -> HashMap<String, ModelPricing> {
    let now = Utc::now();
    let mut pricing = HashMap::new();

    let mut insert = |model: &str, provider: &str, input: f64, output: f64, context: u32| {
        pricing.insert(
            model.to_string(),
            ModelPricing {
                model: model.to_string(),
                provider: provider.to_string(),
                input_cost_per_million: input,
                output_cost_per_million: output,
                context_window: context,
                updated_at: now,
            },
        );
    };

    // OpenAI GPT-5 family (Aug 2025~)
    insert("gpt-5", "openai", GPT5_INPUT_COST, GPT5_OUTPUT_COST, 400_000);
    insert(
        "gpt-5-nano",
        "openai",
        GPT5_NANO_INPUT_COST,
        GPT5_NANO_OUTPUT_COST,
        32_000,
    );

    // OpenAI GPT-4o family (legacy, still routed)
    insert("gpt-4o", "openai", GPT4O_INPUT_COST, GPT4O_OUTPUT_COST, 128_000);
    insert(
        "gpt-4o-mini",
        "openai",
        GPT4O_MINI_INPUT_COST,
        GPT4O_MINI_OUTPUT_COST,
        128_000,
    );

    // Anthropic Claude 4.5 family
    insert(
        "claude-opus-4-5-20250514",
        "anthropic",
        CLAUDE_OPUS45_INPUT_COST,
        CLAUDE_OPUS45_OUTPUT_COST,
        200_000,
    );
    insert(
        "claude-sonnet-4-5-20250929",
        "anthropic",
        CLAUDE_SONNET45_INPUT_COST,
        CLAUDE_SONNET45_OUTPUT_COST,
        200_000,
    );
    insert(
        "claude-haiku-4-5-20251001",
        "anthropic",
        CLAUDE_HAIKU45_INPUT_COST,
        CLAUDE_HAIKU45_OUTPUT_COST,
        200_000,
    );

    // Legacy Claude 3.5 (still available)
    insert("claude-3-5-sonnet-20241022", "anthropic", 3.00, 15.00, 200_000);
    insert("claude-3-5-haiku-20241022", "anthropic", 0.25, 1.25, 200_000);

    // Google Gemini 2.5 family
    insert(
        "gemini-2.5-flash",
        "gemini",
        GEMINI_FLASH_INPUT_COST,
        GEMINI_FLASH_OUTPUT_COST,
        1_000_000,
    );
    insert(
        "gemini-2.5-pro",
        "gemini",
        GEMINI_PRO_INPUT_COST,
        GEMINI_PRO_OUTPUT_COST,
        1_000_000,
    );

    // Legacy Gemini 1.5 models
    insert("gemini-1.5-pro", "gemini", 1.25, 5.00, 2_000_000);
    insert("gemini-1.5-flash", "gemini", 0.075, 0.30, 1_000_000);

    pricing
}
