//! Dropout regularization
//!
//! During training, zeroes elements with probability `p` and scales survivors
//! by `1/(1-p)` (inverted dropout). In eval mode it is the identity.
//!
//! The mask comes from the caller's [`SplitMix64`], so the dropout stream is
//! part of the checkpointed RNG state and replays exactly after a resume.

use crate::data::SplitMix64;
use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use numr::autograd::{Var, var_mul};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f64,
}

impl Dropout {
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidArgument {
                arg: "p",
                reason: format!("dropout probability must be in [0, 1), got {p}"),
            });
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn forward<R, C>(
        &self,
        client: &C,
        input: &Var<R>,
        rng: &mut SplitMix64,
        training: bool,
    ) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        if !training || self.p == 0.0 {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.p;
        let scale = (1.0 / keep) as f32;
        let n = input.tensor().numel();
        let mask: Vec<f32> = (0..n)
            .map(|_| if rng.next_f64() < keep { scale } else { 0.0 })
            .collect();
        let mask = Tensor::<R>::from_slice(&mask, input.shape(), input.tensor().device());
        var_mul(input, &Var::new(mask, false), client).map_err(Error::Numr)
    }
}
