//! Text generation request types

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const MAX_TOKENS_LIMIT: u32 = 4096;

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_min_p() -> f32 {
    0.05
}

fn default_stop() -> Vec<String> {
    vec!["<|endoftext|>".to_string(), "<|im_end|>".to_string()]
}

/// Sampling parameters accepted by every LLM backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
            min_p: default_min_p(),
            stop: default_stop(),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 || self.max_tokens > MAX_TOKENS_LIMIT {
            return Err(Error::invalid_input(format!(
                "max_tokens must be between 1 and {}",
                MAX_TOKENS_LIMIT
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::invalid_input("temperature must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::invalid_input("top_p must be between 0 and 1"));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty < 0.0 {
            return Err(Error::invalid_input("repeat_penalty must be >= 0"));
        }
        if !self.min_p.is_finite() || self.min_p < 0.0 {
            return Err(Error::invalid_input("min_p must be >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let params: SamplingParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params, SamplingParams::default());
        assert_eq!(params.max_tokens, 512);
        assert_eq!(params.stop.len(), 2);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validation_bounds() {
        let mut params = SamplingParams::default();
        params.max_tokens = 5000;
        assert!(params.validate().is_err());

        let mut params = SamplingParams::default();
        params.top_p = 1.5;
        assert!(params.validate().is_err());

        let mut params = SamplingParams::default();
        params.temperature = -0.1;
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidInput { stage: None, .. })
        ));
    }
}
