//! Per-model token pricing
//!
//! Prices are USD per million tokens. A model id resolves to the table entry
//! with the longest key that prefixes it (`claude-sonnet-4-20250514` matches
//! `claude-sonnet-4`); unknown models are billed at the default model's rate.

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

const PER_MTOK: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_write_per_mtok: f64,
    pub cache_read_per_mtok: f64,
}

impl ModelPricing {
    /// Cache rates derived the way Anthropic prices them: writes at 1.25x
    /// input, reads at 0.1x input.
    pub const fn standard(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            cache_write_per_mtok: input_per_mtok * 1.25,
            cache_read_per_mtok: input_per_mtok * 0.1,
        }
    }
}

const BUILTIN: &[(&str, ModelPricing)] = &[
    ("claude-opus-4", ModelPricing::standard(15.0, 75.0)),
    ("claude-opus-4-5", ModelPricing::standard(5.0, 25.0)),
    ("claude-sonnet-4", ModelPricing::standard(3.0, 15.0)),
    ("claude-3-7-sonnet", ModelPricing::standard(3.0, 15.0)),
    ("claude-3-5-sonnet", ModelPricing::standard(3.0, 15.0)),
    ("claude-haiku-4-5", ModelPricing::standard(1.0, 5.0)),
    ("claude-3-5-haiku", ModelPricing::standard(0.8, 4.0)),
    ("claude-3-haiku", ModelPricing::standard(0.25, 1.25)),
];

/// `[[pricing]]` config entry. Cache rates default to the standard multipliers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_write_per_mtok: Option<f64>,
    #[serde(default)]
    pub cache_read_per_mtok: Option<f64>,
}

impl PricingEntry {
    fn to_pricing(&self) -> Result<ModelPricing> {
        let rates = [
            self.input_per_mtok,
            self.output_per_mtok,
            self.cache_write_per_mtok.unwrap_or(0.0),
            self.cache_read_per_mtok.unwrap_or(0.0),
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(Error::InvalidPricing {
                model: self.model.clone(),
                reason: "rates must be finite and non-negative".into(),
            });
        }
        let standard = ModelPricing::standard(self.input_per_mtok, self.output_per_mtok);
        Ok(ModelPricing {
            cache_write_per_mtok: self
                .cache_write_per_mtok
                .unwrap_or(standard.cache_write_per_mtok),
            cache_read_per_mtok: self
                .cache_read_per_mtok
                .unwrap_or(standard.cache_read_per_mtok),
            ..standard
        })
    }
}

/// Token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Vec<(String, ModelPricing)>,
    default_model: String,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            entries: BUILTIN
                .iter()
                .map(|(model, pricing)| (model.to_string(), *pricing))
                .collect(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl PricingTable {
    /// Built-in table with configured entries added or replacing built-ins.
    pub fn with_overrides(overrides: &[PricingEntry]) -> Result<Self> {
        let mut table = Self::default();
        for entry in overrides {
            let pricing = entry.to_pricing()?;
            match table.entries.iter_mut().find(|(m, _)| *m == entry.model) {
                Some(existing) => existing.1 = pricing,
                None => table.entries.push((entry.model.clone(), pricing)),
            }
        }
        Ok(table)
    }

    /// Pricing for `model`, falling back to the default model.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.lookup(model)
            .or_else(|| self.lookup(&self.default_model))
            .unwrap_or(ModelPricing::standard(3.0, 15.0))
    }

    fn lookup(&self, model: &str) -> Option<ModelPricing> {
        self.entries
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, pricing)| *pricing)
    }

    /// USD cost of `input` + `output` tokens.
    pub fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.pricing_for(model);
        (input_tokens as f64 * pricing.input_per_mtok
            + output_tokens as f64 * pricing.output_per_mtok)
            / PER_MTOK
    }

    /// USD cost including prompt-cache writes and reads.
    pub fn calculate_cost_with_cache(&self, model: &str, usage: &TokenUsage) -> f64 {
        let pricing = self.pricing_for(model);
        self.calculate_cost(model, usage.input_tokens, usage.output_tokens)
            + (usage.cache_creation_tokens as f64 * pricing.cache_write_per_mtok
                + usage.cache_read_tokens as f64 * pricing.cache_read_per_mtok)
                / PER_MTOK
    }
}
