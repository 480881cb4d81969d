//! GPT model configuration
//!
//! Loadable from YAML or JSON; validated before any weights are allocated.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Decoder-only transformer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    #[serde(default)]
    pub drop_rate: f64,
    #[serde(default)]
    pub qkv_bias: bool,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self::gpt_375m()
    }
}

impl GptConfig {
    /// 16 layers x 16 heads x 1024 wide, 1024-token context.
    pub fn gpt_375m() -> Self {
        Self {
            vocab_size: 50264,
            context_length: 1024,
            emb_dim: 1024,
            n_heads: 16,
            n_layers: 16,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// GPT-2 small layout.
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: 50257,
            context_length: 1024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.emb_dim / self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
            ("emb_dim", self.emb_dim),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigError {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.emb_dim % self.n_heads != 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "emb_dim ({}) must be divisible by n_heads ({})",
                    self.emb_dim, self.n_heads
                ),
            });
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(Error::ConfigError {
                reason: format!("drop_rate must be in [0, 1), got {}", self.drop_rate),
            });
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}
