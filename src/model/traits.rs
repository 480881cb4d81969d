//! Model seams: client bound alias and the language-model trait.

use crate::error::Result;
use crate::nn::ParamStore;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::{
    ActivationOps, BinaryOps, IndexingOps, ReduceOps, ScalarOps, ShapeOps, TensorOps, UnaryOps,
};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Trait alias for the client bounds required by forward passes and their backward.
pub trait ModelClient<R: Runtime>:
    RuntimeClient<R>
    + TensorOps<R>
    + ScalarOps<R>
    + ReduceOps<R>
    + IndexingOps<R>
    + ShapeOps<R>
    + ActivationOps<R>
    + BinaryOps<R>
    + UnaryOps<R>
{
}

impl<R, C> ModelClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + TensorOps<R>
        + ScalarOps<R>
        + ReduceOps<R>
        + IndexingOps<R>
        + ShapeOps<R>
        + ActivationOps<R>
        + BinaryOps<R>
        + UnaryOps<R>,
{
}

/// Autoregressive token model driven by the trainer.
///
/// Parameters live in a [`ParamStore`] owned by the model; the optimizer
/// updates them in place through [`LanguageModel::params_mut`].
pub trait LanguageModel<R: Runtime<DType = DType>> {
    /// tokens: `[batch, seq]` i64 -> logits: `[batch, seq, vocab]`
    fn forward<C>(&mut self, client: &C, tokens: &Tensor<R>) -> Result<Var<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>;

    /// Train mode enables dropout and gradient tracking.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Longest sequence the model accepts.
    fn context_length(&self) -> usize;

    /// Device holding the parameters; inputs are built here.
    fn device(&self) -> &R::Device;

    fn params(&self) -> &ParamStore<R>;

    fn params_mut(&mut self) -> &mut ParamStore<R>;

    /// Whether weight decay applies to the named parameter.
    fn decays(&self, name: &str) -> bool {
        !(name.ends_with(".bias") || name.contains("norm"))
    }

    /// Dropout RNG state, checkpointed with the parameters.
    fn rng_state(&self) -> u64;

    fn set_rng_state(&mut self, state: u64);

    /// Stable description of the architecture, compared on checkpoint load.
    fn architecture(&self) -> String;
}
