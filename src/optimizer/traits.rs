//! Optimizer trait abstraction
//!
//! Trainers drive any optimizer through this interface; parameters live in a
//! [`ParamStore`] and are replaced in place, keeping their ids.

use crate::error::Result;
use crate::nn::ParamStore;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};

pub trait Optimizer<R: Runtime<DType = DType>> {
    /// Perform one optimization step.
    ///
    /// Parameters without gradients are skipped.
    fn step<C>(&mut self, client: &C, params: &mut ParamStore<R>, grads: &GradStore<R>) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>;

    fn set_lr(&mut self, lr: f64);

    fn lr(&self) -> f64;

    /// Number of steps taken so far.
    fn timestep(&self) -> u64;

    /// Reset all optimizer state (moments, timestep).
    fn reset(&mut self);
}
