//! Layer Normalization
//!
//! output = (x - mean) * (var + eps)^-1/2 * scale + shift, biased variance.
//! Composed from numr autograd primitives for training support. Only ops whose
//! backward keeps the upstream graph are used here; `var_sqrt` does not.

use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use crate::nn::init::{ones_tensor, zeros_tensor};
use crate::nn::params::ParamStore;
use numr::autograd::{Var, var_add, var_add_scalar, var_mean, var_mul, var_pow_scalar, var_sub};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;

/// scale: `[hidden]` (ones), shift: `[hidden]` (zeros)
#[derive(Debug, Clone)]
pub struct LayerNorm {
    scale: TensorId,
    shift: TensorId,
    eps: f64,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f64 = 1e-5;

    /// Register `{name}.weight` and `{name}.bias`.
    pub fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        name: &str,
        hidden: usize,
        device: &R::Device,
    ) -> Result<Self> {
        let scale = store.register(format!("{name}.weight"), ones_tensor::<R>(&[hidden], device))?;
        let shift = store.register(format!("{name}.bias"), zeros_tensor::<R>(&[hidden], device))?;
        Ok(Self {
            scale,
            shift,
            eps: Self::DEFAULT_EPS,
        })
    }

    /// input: `[..., hidden]`, output: same shape
    pub fn forward<R, C>(&self, client: &C, store: &ParamStore<R>, input: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let last_dim = input.shape().len() - 1;

        let mean = var_mean(input, &[last_dim], true, client).map_err(Error::Numr)?;
        let centered = var_sub(input, &mean, client).map_err(Error::Numr)?;

        let sq = var_mul(&centered, &centered, client).map_err(Error::Numr)?;
        let variance = var_mean(&sq, &[last_dim], true, client).map_err(Error::Numr)?;

        let var_eps = var_add_scalar(&variance, self.eps, client).map_err(Error::Numr)?;
        let inv_std = var_pow_scalar(&var_eps, -0.5, client).map_err(Error::Numr)?;
        let normed = var_mul(&centered, &inv_std, client).map_err(Error::Numr)?;

        let scaled = var_mul(&normed, &store.var(self.scale)?, client).map_err(Error::Numr)?;
        var_add(&scaled, &store.var(self.shift)?, client).map_err(Error::Numr)
    }

    pub fn param_ids(&self) -> [TensorId; 2] {
        [self.scale, self.shift]
    }
}
