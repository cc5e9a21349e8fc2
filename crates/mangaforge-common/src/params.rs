//! Generation parameters: the immutable per-session tuning knobs.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-phase timeouts in seconds, indexed by phase 1..=7.
const DEFAULT_PHASE_TIMEOUT_SECS: [u64; 7] = [12, 18, 15, 20, 25, 4, 3];

/// Model invocation settings for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "text-default".to_string(),
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 4096,
        }
    }
}

/// Immutable value object describing how one session should generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub primary_genre: String,
    /// Phases scoring below this threshold request feedback when HITL is on.
    pub quality_threshold: f64,
    pub enable_hitl: bool,
    pub max_parallel_image_generations: usize,
    /// Overrides of the default per-phase timeouts, in seconds.
    #[serde(default)]
    pub per_phase_timeouts: HashMap<u8, u64>,
    /// Per-phase model overrides; phases not listed use the default config.
    #[serde(default)]
    pub phase_model_config: HashMap<u8, ModelConfig>,
    pub fallback_enabled: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            primary_genre: String::new(),
            quality_threshold: 0.6,
            enable_hitl: false,
            max_parallel_image_generations: 4,
            per_phase_timeouts: HashMap::new(),
            phase_model_config: HashMap::new(),
            fallback_enabled: true,
        }
    }
}

impl GenerationParameters {
    /// Effective timeout for a phase, falling back to the built-in defaults.
    pub fn timeout_for(&self, phase: u8) -> Duration {
        let secs = self
            .per_phase_timeouts
            .get(&phase)
            .copied()
            .unwrap_or_else(|| {
                DEFAULT_PHASE_TIMEOUT_SECS
                    .get(phase.saturating_sub(1) as usize)
                    .copied()
                    .unwrap_or(30)
            });
        Duration::from_secs(secs)
    }

    /// Effective model configuration for a phase.
    pub fn model_for(&self, phase: u8) -> ModelConfig {
        self.phase_model_config
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_phase_table() {
        let params = GenerationParameters::default();
        assert_eq!(params.timeout_for(1), Duration::from_secs(12));
        assert_eq!(params.timeout_for(5), Duration::from_secs(25));
        assert_eq!(params.timeout_for(7), Duration::from_secs(3));
    }

    #[test]
    fn timeout_override_wins() {
        let mut params = GenerationParameters::default();
        params.per_phase_timeouts.insert(1, 99);
        assert_eq!(params.timeout_for(1), Duration::from_secs(99));
        assert_eq!(params.timeout_for(2), Duration::from_secs(18));
    }

    #[test]
    fn model_override_applies_per_phase() {
        let mut params = GenerationParameters::default();
        params.phase_model_config.insert(
            4,
            ModelConfig {
                model_id: "layout-model".into(),
                temperature: 0.2,
                ..ModelConfig::default()
            },
        );
        assert_eq!(params.model_for(4).model_id, "layout-model");
        assert_eq!(params.model_for(1).model_id, "text-default");
    }
}
