//! AdamW optimizer
//!
//! Decoupled weight decay (Loshchilov & Hutter, 2019), written with plain
//! numr tensor ops so it runs on any backend. Moments are keyed by parameter
//! id and can be exported and re-imported for checkpointing.

use crate::error::{Error, Result};
use crate::nn::ParamStore;
use crate::optimizer::traits::Optimizer;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::{HashMap, HashSet};

/// AdamW configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

/// First and second moment estimates for one parameter.
pub struct Moments<R: Runtime> {
    pub m: Tensor<R>,
    pub v: Tensor<R>,
}

/// AdamW with per-parameter decay exclusion.
///
/// State is lazily initialized on the first `step()` that sees a gradient for
/// a parameter.
pub struct AdamW<R: Runtime> {
    config: AdamWConfig,
    state: HashMap<TensorId, Moments<R>>,
    no_decay: HashSet<TensorId>,
    timestep: u64,
}

impl<R: Runtime<DType = DType>> AdamW<R> {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
            no_decay: HashSet::new(),
            timestep: 0,
        }
    }

    /// Exclude parameters from weight decay (biases and norm scales).
    pub fn exclude_from_decay(&mut self, ids: impl IntoIterator<Item = TensorId>) {
        self.no_decay.extend(ids);
    }

    pub fn decays(&self, id: TensorId) -> bool {
        !self.no_decay.contains(&id)
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn moments(&self, id: TensorId) -> Option<&Moments<R>> {
        self.state.get(&id)
    }

    /// Install moments for a parameter, e.g. from a checkpoint.
    pub fn set_moments(&mut self, id: TensorId, m: Tensor<R>, v: Tensor<R>) -> Result<()> {
        if m.shape() != v.shape() {
            return Err(Error::TrainingError {
                reason: format!("moment shapes differ: {:?} vs {:?}", m.shape(), v.shape()),
            });
        }
        self.state.insert(id, Moments { m, v });
        Ok(())
    }

    pub fn set_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
    }

    /// Replace the whole optimizer state at once.
    pub fn restore(&mut self, timestep: u64, state: HashMap<TensorId, Moments<R>>) {
        self.timestep = timestep;
        self.state = state;
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for AdamW<R> {
    fn step<C>(&mut self, client: &C, params: &mut ParamStore<R>, grads: &GradStore<R>) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>,
    {
        self.timestep += 1;
        let t = self.timestep as i32;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        let ids: Vec<TensorId> = params.tensors().keys().copied().collect();
        for id in ids {
            let Some(grad) = grads.get(id) else {
                continue;
            };
            let Some(param) = params.get(id) else {
                continue;
            };

            let state = self.state.entry(id).or_insert_with(|| Moments {
                m: Tensor::<R>::zeros(param.shape(), DType::F32, param.device()),
                v: Tensor::<R>::zeros(param.shape(), DType::F32, param.device()),
            });

            // m = b1 * m + (1 - b1) * g
            let m = client.add(
                &client.mul_scalar(&state.m, beta1)?,
                &client.mul_scalar(grad, 1.0 - beta1)?,
            )?;
            // v = b2 * v + (1 - b2) * g^2
            let g_sq = client.mul(grad, grad)?;
            let v = client.add(
                &client.mul_scalar(&state.v, beta2)?,
                &client.mul_scalar(&g_sq, 1.0 - beta2)?,
            )?;

            let m_hat = client.mul_scalar(&m, 1.0 / bc1)?;
            let v_hat = client.mul_scalar(&v, 1.0 / bc2)?;
            let denom = client.add_scalar(&client.sqrt(&v_hat)?, eps)?;
            let update = client.div(&m_hat, &denom)?;

            let decayed = if weight_decay > 0.0 && !self.no_decay.contains(&id) {
                client.mul_scalar(param, 1.0 - lr * weight_decay)?
            } else {
                param.clone()
            };
            let new_param = client.sub(&decayed, &client.mul_scalar(&update, lr)?)?;

            state.m = m;
            state.v = v;
            params.tensors_mut().insert(id, new_param);
        }

        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn timestep(&self) -> u64 {
        self.timestep
    }

    fn reset(&mut self) {
        self.state.clear();
        self.timestep = 0;
    }
}
