//! Pure cost arithmetic: turns token/byte usage into currency amounts.
//!
//! Model-name resolution follows exact match, then longest configured
//! prefix, then the table's fallback rates — the same three-tier lookup
//! `control::budget::pricing::PricingRegistry::get_pricing` uses, adapted
//! from per-million to per-1k rates and from a `HashMap` to an
//! order-preserving `Vec` so ties in prefix length break by configured
//! order rather than hash iteration order.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::types::{ModelUsage, ToolUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_per_1k: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_per_1k: Option<f64>,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            cached_input_per_1k: None,
            reasoning_per_1k: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolPricing {
    #[serde(default)]
    pub cost_per_call: f64,
    #[serde(default)]
    pub cost_per_input_byte: f64,
    #[serde(default)]
    pub cost_per_output_byte: f64,
}

/// One row of the model pricing table: a match key plus its rates.
///
/// `pattern` is matched literally (exact), or as a prefix during resolution
/// — there is no embedded wildcard syntax here, unlike policy match
/// patterns; "prefix" is just "the pattern is a prefix of the requested
/// model name".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricingEntry {
    pub pattern: String,
    #[serde(flatten)]
    pub pricing: ModelPricing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPricingEntry {
    pub name: String,
    #[serde(flatten)]
    pub pricing: ToolPricing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingTable {
    pub currency: String,
    pub models: Vec<ModelPricingEntry>,
    pub tools: Vec<ToolPricingEntry>,
    pub fallback_input_per_1k: f64,
    pub fallback_output_per_1k: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            models: Vec::new(),
            tools: Vec::new(),
            fallback_input_per_1k: 0.0,
            fallback_output_per_1k: 0.0,
        }
    }
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact match, then the longest configured prefix, then the table's
    /// fallback rates. Ties in prefix length break by configured order
    /// (first entry registered wins).
    pub fn resolve_model(&self, model: &str) -> ModelPricing {
        if let Some(entry) = self.models.iter().find(|entry| entry.pattern == model) {
            return entry.pricing.clone();
        }

        let mut candidates: Vec<&ModelPricingEntry> = self
            .models
            .iter()
            .filter(|entry| model.starts_with(entry.pattern.as_str()))
            .collect();
        candidates.sort_by_key(|entry| Reverse(entry.pattern.len()));

        if let Some(entry) = candidates.into_iter().next() {
            return entry.pricing.clone();
        }

        ModelPricing {
            input_per_1k: self.fallback_input_per_1k,
            output_per_1k: self.fallback_output_per_1k,
            cached_input_per_1k: None,
            reasoning_per_1k: None,
        }
    }

    pub fn resolve_tool(&self, tool: &str) -> ToolPricing {
        self.tools
            .iter()
            .find(|entry| entry.name == tool)
            .map(|entry| entry.pricing.clone())
            .unwrap_or_default()
    }

    /// `model_cost = (prompt - cached)/1000 * input_per_1k
    ///             + cached/1000 * cached_input_per_1k (if configured)
    ///             + completion/1000 * output_per_1k
    ///             + reasoning/1000 * reasoning_per_1k (if configured)`
    pub fn calculate_model_cost(&self, model: &str, usage: &ModelUsage) -> f64 {
        let pricing = self.resolve_model(model);
        let billable_input = usage.prompt_tokens.saturating_sub(usage.cached_tokens);

        let mut cost = (billable_input as f64 / 1000.0) * pricing.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * pricing.output_per_1k;

        if let Some(cached_rate) = pricing.cached_input_per_1k {
            cost += (usage.cached_tokens as f64 / 1000.0) * cached_rate;
        }
        if let Some(reasoning_rate) = pricing.reasoning_per_1k {
            cost += (usage.reasoning_tokens as f64 / 1000.0) * reasoning_rate;
        }

        cost
    }

    pub fn calculate_tool_cost(&self, tool: &str, usage: &ToolUsage) -> f64 {
        let pricing = self.resolve_tool(tool);
        pricing.cost_per_call
            + usage.input_bytes as f64 * pricing.cost_per_input_byte
            + usage.output_bytes as f64 * pricing.cost_per_output_byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable {
            currency: "usd".to_string(),
            models: vec![
                ModelPricingEntry {
                    pattern: "gpt-4o".to_string(),
                    pricing: ModelPricing {
                        input_per_1k: 0.005,
                        output_per_1k: 0.015,
                        cached_input_per_1k: Some(0.0025),
                        reasoning_per_1k: None,
                    },
                },
                ModelPricingEntry {
                    pattern: "gpt-4o-mini".to_string(),
                    pricing: ModelPricing {
                        input_per_1k: 0.00015,
                        output_per_1k: 0.0006,
                        cached_input_per_1k: None,
                        reasoning_per_1k: None,
                    },
                },
            ],
            tools: vec![ToolPricingEntry {
                name: "web_search".to_string(),
                pricing: ToolPricing {
                    cost_per_call: 0.01,
                    cost_per_input_byte: 0.0,
                    cost_per_output_byte: 0.000001,
                },
            }],
            fallback_input_per_1k: 0.001,
            fallback_output_per_1k: 0.002,
        }
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let pricing = table().resolve_model("gpt-4o-mini");
        assert_eq!(pricing.input_per_1k, 0.00015);
    }

    #[test]
    fn longest_prefix_wins() {
        let pricing = table().resolve_model("gpt-4o-mini-2024-07-18");
        assert_eq!(pricing.input_per_1k, 0.00015);
    }

    #[test]
    fn shorter_prefix_used_when_longer_does_not_match() {
        let pricing = table().resolve_model("gpt-4o-2024-08-06");
        assert_eq!(pricing.input_per_1k, 0.005);
    }

    #[test]
    fn unknown_model_falls_back() {
        let pricing = table().resolve_model("unknown-model");
        assert_eq!(pricing.input_per_1k, 0.001);
        assert_eq!(pricing.output_per_1k, 0.002);
    }

    #[test]
    fn model_cost_is_homogeneous() {
        let t = table();
        let usage = ModelUsage {
            prompt_tokens: 1000,
            completion_tokens: 500,
            cached_tokens: 0,
            reasoning_tokens: 0,
        };
        let doubled = ModelUsage {
            prompt_tokens: 2000,
            completion_tokens: 1000,
            cached_tokens: 0,
            reasoning_tokens: 0,
        };
        let base = t.calculate_model_cost("gpt-4o", &usage);
        let scaled = t.calculate_model_cost("gpt-4o", &doubled);
        assert!((scaled - 2.0 * base).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_split_from_billable_input() {
        let t = table();
        let usage = ModelUsage {
            prompt_tokens: 1000,
            completion_tokens: 0,
            cached_tokens: 400,
            reasoning_tokens: 0,
        };
        let cost = t.calculate_model_cost("gpt-4o", &usage);
        let expected = (600.0 / 1000.0) * 0.005 + (400.0 / 1000.0) * 0.0025;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn tool_cost_combines_call_and_byte_rates() {
        let cost = table().calculate_tool_cost(
            "web_search",
            &ToolUsage {
                input_bytes: 100,
                output_bytes: 2_000_000,
            },
        );
        assert!((cost - (0.01 + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn unknown_tool_has_zero_cost() {
        let cost = table().calculate_tool_cost(
            "unregistered",
            &ToolUsage {
                input_bytes: 1000,
                output_bytes: 1000,
            },
        );
        assert_eq!(cost, 0.0);
    }
}
