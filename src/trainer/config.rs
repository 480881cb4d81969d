//! Run configuration
//!
//! One serde document with four sections. Every field has a default, so a
//! config file only lists what it changes:
//!
//! ```yaml
//! model:
//!   vocab_size: 257
//!   context_length: 256
//!   emb_dim: 256
//!   n_heads: 4
//!   n_layers: 4
//! train:
//!   learning_rate: 3.0e-4
//!   batch_size: 64
//!   micro_batch_size: 4
//! data:
//!   path: corpus.txt
//! dist:
//!   world_size: 2
//! ```

use std::path::{Path, PathBuf};

use crate::data::CorpusFormat;
use crate::distributed::DistSettings;
use crate::error::{Error, Result};
use crate::model::GptConfig;
use crate::optimizer::{AccumulationSchedule, AdamWConfig};
use serde::{Deserialize, Serialize};

/// Optimization and reporting cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    pub learning_rate: f64,
    pub num_epochs: u64,
    /// Examples per optimizer step, per worker.
    pub batch_size: usize,
    /// Examples per forward/backward pass.
    pub micro_batch_size: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub grad_clip: f64,
    /// Evaluate every this many micro-batches.
    pub eval_freq: usize,
    /// Batches per loss estimate.
    pub eval_iter: usize,
    /// Checkpoint every this many optimizer steps.
    pub checkpoint_every: u64,
    pub checkpoint_path: PathBuf,
    pub seed: u64,
    pub start_context: String,
    pub max_new_tokens: usize,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            num_epochs: 10,
            batch_size: 64,
            micro_batch_size: 4,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            grad_clip: 1.0,
            eval_freq: 50,
            eval_iter: 1,
            checkpoint_every: 100,
            checkpoint_path: PathBuf::from("checkpoint.bin"),
            seed: 123,
            start_context: "Every effort moves you".to_string(),
            max_new_tokens: 50,
        }
    }
}

impl TrainSettings {
    pub fn accumulation(&self) -> Result<AccumulationSchedule> {
        AccumulationSchedule::new(self.batch_size, self.micro_batch_size)
    }

    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub path: Option<PathBuf>,
    pub format: CorpusFormat,
    /// Fraction of the corpus used for training; the rest validates.
    pub train_ratio: f64,
    /// Window step; defaults to the context length.
    pub stride: Option<usize>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: None,
            format: CorpusFormat::Text,
            train_ratio: 0.9,
            stride: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: GptConfig,
    pub train: TrainSettings,
    pub data: DataSettings,
    pub dist: DistSettings,
}

impl RunConfig {
    /// Load from `.yaml`/`.yml` or `.json`, chosen by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let config: Self = match ext.as_deref() {
            Some("yaml" | "yml") => serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
                reason: format!("YAML parse error in {}: {e}", path.display()),
            })?,
            Some("json") => serde_json::from_str(&content).map_err(|e| Error::ConfigError {
                reason: format!("JSON parse error in {}: {e}", path.display()),
            })?,
            _ => {
                return Err(Error::ConfigError {
                    reason: format!("{}: expected a .yaml, .yml or .json file", path.display()),
                });
            }
        };
        Ok(config)
    }

    /// Reject anything that would fail mid-run.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.train.accumulation()?;
        self.dist.validate()?;

        let t = &self.train;
        let checks = [
            (t.learning_rate > 0.0, "learning_rate must be > 0"),
            (t.num_epochs > 0, "num_epochs must be > 0"),
            (t.weight_decay >= 0.0, "weight_decay must be >= 0"),
            ((0.0..1.0).contains(&t.beta1), "beta1 must be in [0, 1)"),
            ((0.0..1.0).contains(&t.beta2), "beta2 must be in [0, 1)"),
            (t.eps > 0.0, "eps must be > 0"),
            (t.grad_clip > 0.0, "grad_clip must be > 0"),
            (t.eval_freq > 0, "eval_freq must be > 0"),
            (t.eval_iter > 0, "eval_iter must be > 0"),
            (t.checkpoint_every > 0, "checkpoint_every must be > 0"),
            (
                self.data.train_ratio > 0.0 && self.data.train_ratio < 1.0,
                "train_ratio must be in (0, 1)",
            ),
            (self.data.stride != Some(0), "stride must be > 0"),
        ];
        for (ok, reason) in checks {
            if !ok {
                return Err(Error::ConfigError {
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        self.data.stride.unwrap_or(self.model.context_length)
    }
}
