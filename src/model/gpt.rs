//! GPT: token + position embeddings, pre-norm transformer blocks, LM head.
//!
//! ```text
//! tokens [B, T]
//!   -> tok_emb + pos_emb -> dropout
//!   -> n_layers x { x + drop(attn(norm1(x))); x + drop(ff(norm2(x))) }
//!   -> final_norm -> out_head -> logits [B, T, V]
//! ```
//!
//! Attention runs one head at a time over row slices of the packed Q/K/V
//! weights, then concatenates head outputs on the feature dim. Every
//! intermediate stays contiguous, so the autograd graph is never cut.

use std::collections::HashMap;

use crate::data::SplitMix64;
use crate::error::{Error, Result};
use crate::model::config::GptConfig;
use crate::model::traits::{LanguageModel, ModelClient};
use crate::nn::{Dropout, Embedding, LayerNorm, Linear, ParamStore, gelu};
use numr::autograd::{Var, var_add, var_cat, var_matmul, var_mul_scalar, var_softmax, var_transpose};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Masked logits get this instead of `-inf` so a fully masked row stays finite.
const MASK_VALUE: f32 = -1e9;

/// Per-forward context shared by all blocks.
struct Pass<'a, R: Runtime> {
    store: &'a ParamStore<R>,
    rng: &'a mut SplitMix64,
    dropout: Dropout,
    training: bool,
    mask: Var<R>,
}

struct CausalSelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        prefix: &str,
        cfg: &GptConfig,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Result<Self> {
        let c = cfg.emb_dim;
        Ok(Self {
            q: Linear::init(store, &format!("{prefix}.q"), c, c, cfg.qkv_bias, rng, device)?,
            k: Linear::init(store, &format!("{prefix}.k"), c, c, cfg.qkv_bias, rng, device)?,
            v: Linear::init(store, &format!("{prefix}.v"), c, c, cfg.qkv_bias, rng, device)?,
            proj: Linear::init(store, &format!("{prefix}.proj"), c, c, true, rng, device)?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward<R, C>(&self, client: &C, pass: &mut Pass<'_, R>, x: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut heads = Vec::with_capacity(self.n_heads);
        for h in 0..self.n_heads {
            let start = h * self.head_dim;
            let q = self.q.forward_rows(client, pass.store, x, start, self.head_dim)?;
            let k = self.k.forward_rows(client, pass.store, x, start, self.head_dim)?;
            let v = self.v.forward_rows(client, pass.store, x, start, self.head_dim)?;

            // [B, T, hd] @ [B, hd, T] -> [B, T, T]
            let k_t = var_transpose(&k).map_err(Error::Numr)?;
            let scores = var_matmul(&q, &k_t, client).map_err(Error::Numr)?;
            let scores = var_mul_scalar(&scores, scale, client).map_err(Error::Numr)?;
            let scores = var_add(&scores, &pass.mask, client).map_err(Error::Numr)?;
            let weights = var_softmax(&scores, -1, client).map_err(Error::Numr)?;
            let weights = pass
                .dropout
                .forward(client, &weights, pass.rng, pass.training)?;

            heads.push(var_matmul(&weights, &v, client).map_err(Error::Numr)?);
        }
        let head_refs: Vec<&Var<R>> = heads.iter().collect();
        let context = var_cat(&head_refs, 2, client).map_err(Error::Numr)?;
        self.proj.forward(client, pass.store, &context)
    }
}

struct FeedForward {
    fc: Linear,
    proj: Linear,
}

impl FeedForward {
    fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        prefix: &str,
        cfg: &GptConfig,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Result<Self> {
        let c = cfg.emb_dim;
        Ok(Self {
            fc: Linear::init(store, &format!("{prefix}.fc"), c, 4 * c, true, rng, device)?,
            proj: Linear::init(store, &format!("{prefix}.proj"), 4 * c, c, true, rng, device)?,
        })
    }

    fn forward<R, C>(&self, client: &C, store: &ParamStore<R>, x: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let hidden = self.fc.forward(client, store, x)?;
        let hidden = gelu(client, &hidden)?;
        self.proj.forward(client, store, &hidden)
    }
}

struct TransformerBlock {
    norm1: LayerNorm,
    attn: CausalSelfAttention,
    norm2: LayerNorm,
    ff: FeedForward,
}

impl TransformerBlock {
    fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        layer: usize,
        cfg: &GptConfig,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Result<Self> {
        let prefix = format!("blocks.{layer}");
        Ok(Self {
            norm1: LayerNorm::init(store, &format!("{prefix}.norm1"), cfg.emb_dim, device)?,
            attn: CausalSelfAttention::init(store, &format!("{prefix}.attn"), cfg, rng, device)?,
            norm2: LayerNorm::init(store, &format!("{prefix}.norm2"), cfg.emb_dim, device)?,
            ff: FeedForward::init(store, &format!("{prefix}.ff"), cfg, rng, device)?,
        })
    }

    fn forward<R, C>(&self, client: &C, pass: &mut Pass<'_, R>, x: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let h = self.norm1.forward(client, pass.store, x)?;
        let h = self.attn.forward(client, pass, &h)?;
        let h = pass.dropout.forward(client, &h, pass.rng, pass.training)?;
        let x = var_add(&h, x, client).map_err(Error::Numr)?;

        let h = self.norm2.forward(client, pass.store, &x)?;
        let h = self.ff.forward(client, pass.store, &h)?;
        let h = pass.dropout.forward(client, &h, pass.rng, pass.training)?;
        var_add(&h, &x, client).map_err(Error::Numr)
    }
}

/// Decoder-only transformer language model.
pub struct GptModel<R: Runtime> {
    config: GptConfig,
    store: ParamStore<R>,
    tok_emb: Embedding,
    pos_emb: Embedding,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Linear,
    dropout: Dropout,
    training: bool,
    rng: SplitMix64,
    masks: HashMap<usize, Tensor<R>>,
    device: R::Device,
}

impl<R: Runtime<DType = DType>> GptModel<R> {
    /// Build and initialize a model. Equal seeds give bit-identical weights,
    /// which is how data-parallel replicas start in sync.
    pub fn new(config: GptConfig, seed: u64, device: &R::Device) -> Result<Self> {
        config.validate()?;
        let mut rng = SplitMix64::new(seed);
        let mut store = ParamStore::new();

        let tok_emb = Embedding::init(&mut store, "tok_emb", config.vocab_size, config.emb_dim, &mut rng, device)?;
        let pos_emb = Embedding::init(&mut store, "pos_emb", config.context_length, config.emb_dim, &mut rng, device)?;
        let blocks = (0..config.n_layers)
            .map(|layer| TransformerBlock::init(&mut store, layer, &config, &mut rng, device))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::init(&mut store, "final_norm", config.emb_dim, device)?;
        let out_head = Linear::init(&mut store, "out_head", config.emb_dim, config.vocab_size, false, &mut rng, device)?;
        let dropout = Dropout::new(config.drop_rate)?;

        tracing::debug!(
            parameters = store.num_parameters(),
            tensors = store.len(),
            "initialized GPT model"
        );

        Ok(Self {
            config,
            store,
            tok_emb,
            pos_emb,
            blocks,
            final_norm,
            out_head,
            dropout,
            training: true,
            rng,
            masks: HashMap::new(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn num_parameters(&self) -> usize {
        self.store.num_parameters()
    }

    /// `[T, T]` additive causal mask, built once per sequence length.
    fn causal_mask(&mut self, seq_len: usize) -> Tensor<R> {
        let device = &self.device;
        self.masks
            .entry(seq_len)
            .or_insert_with(|| {
                let mut data = vec![0.0f32; seq_len * seq_len];
                for i in 0..seq_len {
                    for j in (i + 1)..seq_len {
                        data[i * seq_len + j] = MASK_VALUE;
                    }
                }
                Tensor::<R>::from_slice(&data, &[seq_len, seq_len], device)
            })
            .clone()
    }
}

impl<R: Runtime<DType = DType>> LanguageModel<R> for GptModel<R> {
    fn forward<C>(&mut self, client: &C, tokens: &Tensor<R>) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let shape = tokens.shape();
        if shape.len() != 2 {
            return Err(Error::ModelError {
                reason: format!("expected [batch, seq] tokens, got shape {shape:?}"),
            });
        }
        let seq_len = shape[1];
        if seq_len == 0 || seq_len > self.config.context_length {
            return Err(Error::ModelError {
                reason: format!(
                    "sequence length {seq_len} outside [1, {}]",
                    self.config.context_length
                ),
            });
        }

        let mask = Var::new(self.causal_mask(seq_len), false);
        let positions: Vec<i64> = (0..seq_len as i64).collect();
        let positions = Tensor::<R>::from_slice(&positions, &[seq_len], &self.device);

        let mut pass = Pass {
            store: &self.store,
            rng: &mut self.rng,
            dropout: self.dropout,
            training: self.training,
            mask,
        };

        let tok = self.tok_emb.forward(client, pass.store, tokens)?;
        let pos = self.pos_emb.forward(client, pass.store, &positions)?;
        let x = var_add(&tok, &pos, client).map_err(Error::Numr)?;
        let mut x = pass.dropout.forward(client, &x, pass.rng, pass.training)?;

        for block in &self.blocks {
            x = block.forward(client, &mut pass, &x)?;
        }

        let x = self.final_norm.forward(client, pass.store, &x)?;
        self.out_head.forward(client, pass.store, &x)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.store.set_track_grads(training);
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn context_length(&self) -> usize {
        self.config.context_length
    }

    fn device(&self) -> &R::Device {
        &self.device
    }

    fn params(&self) -> &ParamStore<R> {
        &self.store
    }

    fn params_mut(&mut self) -> &mut ParamStore<R> {
        &mut self.store
    }

    fn rng_state(&self) -> u64 {
        self.rng.state()
    }

    fn set_rng_state(&mut self, state: u64) {
        self.rng.set_state(state);
    }

    fn architecture(&self) -> String {
        serde_json::to_string(&self.config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::cross_entropy_loss;
    use crate::test_utils::{cpu_setup, tiny_config};
    use numr::autograd::backward;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_forward_shape() {
        let (client, device) = cpu_setup();
        let mut model = GptModel::<CpuRuntime>::new(tiny_config(), 1, &device).unwrap();
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4, 5, 6], &[2, 3], &device);
        let logits = model.forward(&client, &tokens).unwrap();
        assert_eq!(logits.shape(), &[2, 3, tiny_config().vocab_size]);
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let (_, device) = cpu_setup();
        let a = GptModel::<CpuRuntime>::new(tiny_config(), 7, &device).unwrap();
        let b = GptModel::<CpuRuntime>::new(tiny_config(), 7, &device).unwrap();
        for ((na, ta), (nb, tb)) in a.params().named_tensors().zip(b.params().named_tensors()) {
            assert_eq!(na, nb);
            assert_eq!(ta.to_vec::<f32>(), tb.to_vec::<f32>());
        }
    }

    #[test]
    fn test_causal_prefix_invariance() {
        let (client, device) = cpu_setup();
        let mut model = GptModel::<CpuRuntime>::new(tiny_config(), 3, &device).unwrap();
        model.set_training(false);
        let vocab = tiny_config().vocab_size;

        let short = Tensor::<CpuRuntime>::from_slice(&[5i64, 9], &[1, 2], &device);
        let long = Tensor::<CpuRuntime>::from_slice(&[5i64, 9, 11, 2], &[1, 4], &device);
        let a = model.forward(&client, &short).unwrap().tensor().to_vec::<f32>();
        let b = model.forward(&client, &long).unwrap().tensor().to_vec::<f32>();
        for (x, y) in a.iter().zip(b[..2 * vocab].iter()) {
            assert!((x - y).abs() < 1e-4, "future tokens leaked into past logits");
        }
    }

    #[test]
    fn test_too_long_sequence_rejected() {
        let (client, device) = cpu_setup();
        let mut model = GptModel::<CpuRuntime>::new(tiny_config(), 0, &device).unwrap();
        let n = tiny_config().context_length + 1;
        let tokens = Tensor::<CpuRuntime>::from_slice(&vec![0i64; n], &[1, n], &device);
        assert!(model.forward(&client, &tokens).is_err());
    }

    #[test]
    fn test_gradients_reach_every_parameter() {
        let (client, device) = cpu_setup();
        let mut model = GptModel::<CpuRuntime>::new(tiny_config(), 2, &device).unwrap();
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3, 4], &[1, 4], &device);
        let targets = Tensor::<CpuRuntime>::from_slice(&[2i64, 3, 4, 5], &[1, 4], &device);
        let logits = model.forward(&client, &tokens).unwrap();
        let loss = cross_entropy_loss(&client, &logits, &targets).unwrap();
        let grads = backward(&loss, &client).unwrap();
        for (name, id) in model.params().names() {
            assert!(grads.get(id).is_some(), "no gradient for {name}");
        }
    }

    #[test]
    fn test_eval_mode_is_deterministic_and_keeps_rng() {
        let (client, device) = cpu_setup();
        let mut model = GptModel::<CpuRuntime>::new(tiny_config(), 2, &device).unwrap();
        model.set_training(false);
        let before = model.rng_state();
        let tokens = Tensor::<CpuRuntime>::from_slice(&[1i64, 2, 3], &[1, 3], &device);
        let a = model.forward(&client, &tokens).unwrap().tensor().to_vec::<f32>();
        let b = model.forward(&client, &tokens).unwrap().tensor().to_vec::<f32>();
        assert_eq!(a, b);
        assert_eq!(model.rng_state(), before);
    }

    #[test]
    fn test_no_decay_rule() {
        let (_, device) = cpu_setup();
        let model = GptModel::<CpuRuntime>::new(tiny_config(), 0, &device).unwrap();
        assert!(model.decays("blocks.0.attn.q.weight"));
        assert!(!model.decays("blocks.0.attn.proj.bias"));
        assert!(!model.decays("blocks.0.norm1.weight"));
        assert!(!model.decays("final_norm.weight"));
    }
}
