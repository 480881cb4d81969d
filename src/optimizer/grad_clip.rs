//! Gradient clipping by global L2 norm.

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// Scale all gradients so their joint L2 norm is at most `max_norm`.
///
/// Squared norms are accumulated in `order`, so ranks holding identical
/// gradients and passing the same parameter order compute the same norm bit
/// for bit. Gradients not listed in `order` are neither counted nor scaled.
/// Returns the norm before clipping.
pub fn clip_grad_norm<R, C>(
    client: &C,
    grads: &mut GradStore<R>,
    order: &[TensorId],
    max_norm: f64,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ReduceOps<R> + ScalarOps<R> + BinaryOps<R>,
{
    if max_norm.is_nan() || max_norm <= 0.0 {
        return Err(Error::TrainingError {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }

    let mut total_sq = 0.0f64;
    for &id in order {
        if let Some(grad) = grads.get(id) {
            let flat = grad.reshape(&[grad.numel()])?;
            let sq = client.mul(&flat, &flat)?;
            let sum = client.sum(&sq, &[0], false)?;
            total_sq += sum.to_vec::<f32>()[0] as f64;
        }
    }
    let total_norm = total_sq.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for &id in order {
            if let Some(grad) = grads.get(id) {
                let clipped = client.mul_scalar(grad, scale)?;
                grads.insert(id, clipped);
            }
        }
    }

    Ok(total_norm)
}
