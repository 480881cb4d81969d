//! # ddptrain
//!
//! **Data-parallel GPT pretraining on numr.**
//!
//! Each worker holds a full model replica and trains on its own shard of the
//! corpus. Gradients are accumulated over micro-batches and averaged across
//! workers before every optimizer step, so replicas never drift apart.
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ data       │──►│ trainer      │──►│ checkpoint    │
//! │ (shards)   │   │ (orchestrator│   │ (leader only) │
//! └────────────┘   │  per rank)   │   └───────────────┘
//!                  └──────┬───────┘
//!        model / nn / optimizer │ distributed (all-reduce, barrier)
//! ```
//!
//! ## Layout
//!
//! - `data`: tokenizer, sliding-window dataset, distributed sampler, resumable loader
//! - `model`: GPT decoder and greedy generation
//! - `nn`: parameter store and layers built on numr autograd
//! - `optimizer`: AdamW, warmup-cosine LR, accumulation and gradient sync
//! - `distributed`: process groups over numr communicators (nexar mesh between worker threads)
//! - `trainer`: configuration, checkpoints, evaluation and the training loop

pub mod data;
pub mod distributed;
pub mod error;
pub mod model;
pub mod nn;
pub mod optimizer;
pub mod trainer;

pub use data::{ByteTokenizer, DataLoader, SequenceDataset, TokenStream, Tokenizer};
pub use distributed::{CommProcessGroup, DistSettings, ProcessGroup, init_process_groups};
pub use error::{Error, Result};
pub use model::{GptConfig, GptModel, LanguageModel};
pub use trainer::{Orchestrator, RunConfig, RunSummary, build_loaders};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::model::GptConfig;
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }

    /// A model small enough to train in a unit test.
    pub(crate) fn tiny_config() -> GptConfig {
        GptConfig {
            vocab_size: 32,
            context_length: 8,
            emb_dim: 8,
            n_heads: 2,
            n_layers: 1,
            drop_rate: 0.0,
            qkv_bias: false,
        }
    }
}
