//! Language-modeling loss.

use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use numr::autograd::{Var, var_gather, var_log_softmax, var_mean, var_mul_scalar, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Cross-entropy loss: `-mean(log_softmax(logits, -1)[targets])`
///
/// - `logits`: `[..., V]` raw model output
/// - `targets`: `[...]` i64 class indices in `[0, V)`
///
/// Returns a scalar.
pub fn cross_entropy_loss<R, C>(client: &C, logits: &Var<R>, targets: &Tensor<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R>,
    R::Client: ModelClient<R>,
{
    let ndim = logits.shape().len();
    if ndim < 2 {
        return Err(Error::InvalidArgument {
            arg: "logits",
            reason: format!("expected at least 2 dims, got {ndim}"),
        });
    }
    let vocab_size = logits.shape()[ndim - 1];
    let rows: usize = logits.shape()[..ndim - 1].iter().product();
    if targets.numel() != rows {
        return Err(Error::InvalidArgument {
            arg: "targets",
            reason: format!("expected {rows} targets, got {}", targets.numel()),
        });
    }

    let flat = var_reshape(logits, &[rows, vocab_size]).map_err(Error::Numr)?;
    let log_probs = var_log_softmax(&flat, -1, client).map_err(Error::Numr)?;

    // [N] -> [N, 1] for gather along the class dim
    let idx = targets
        .reshape(&[rows])
        .map_err(Error::Numr)?
        .unsqueeze(1)
        .map_err(Error::Numr)?;
    let selected = var_gather(&log_probs, 1, &idx, client).map_err(Error::Numr)?;

    // negate after the mean: numr's var_neg drops the upstream graph
    let mean_log_prob = var_mean(&selected, &[0, 1], false, client).map_err(Error::Numr)?;
    var_mul_scalar(&mean_log_prob, -1.0, client).map_err(Error::Numr)
}
