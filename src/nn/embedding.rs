//! Embedding layer: lookup table for token and position embeddings

use crate::data::SplitMix64;
use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use crate::nn::init::normal_tensor;
use crate::nn::params::ParamStore;
use numr::autograd::{Var, var_gather, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

/// Maps integer indices to dense vectors.
///
/// weight: `[num_embeddings, embed_dim]`
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: TensorId,
    num_embeddings: usize,
    embed_dim: usize,
}

impl Embedding {
    /// Register `{name}.weight`, normal with std 0.02.
    pub fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        name: &str,
        num_embeddings: usize,
        embed_dim: usize,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Result<Self> {
        let weight = store.register(
            format!("{name}.weight"),
            normal_tensor::<R>(&[num_embeddings, embed_dim], 0.02, rng, device),
        )?;
        Ok(Self {
            weight,
            num_embeddings,
            embed_dim,
        })
    }

    /// Gather rows of the table.
    ///
    /// indices: `[...]` i64 tensor, output: `[..., embed_dim]`
    pub fn forward<R, C>(&self, client: &C, store: &ParamStore<R>, indices: &Tensor<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let idx_shape = indices.shape().to_vec();
        let n: usize = idx_shape.iter().product();

        // gather along dim 0 needs [N, embed_dim] indices
        let flat_idx = indices.reshape(&[n]).map_err(Error::Numr)?;
        let expanded = flat_idx
            .unsqueeze(1)
            .map_err(Error::Numr)?
            .broadcast_to(&[n, self.embed_dim])
            .map_err(Error::Numr)?;

        let weight = store.var(self.weight)?;
        let gathered = var_gather(&weight, 0, &expanded, client).map_err(Error::Numr)?;

        let mut out_shape = idx_shape;
        out_shape.push(self.embed_dim);
        var_reshape(&gathered, &out_shape).map_err(Error::Numr)
    }

    pub fn weight_id(&self) -> TensorId {
        self.weight
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}
