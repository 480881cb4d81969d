//! Gradient averaging across a process group
//!
//! Gradients are packed into one flat host buffer in parameter-name order,
//! averaged with a single collective, and unpacked back into the store.
//! Name order is identical on every rank even though tensor ids are not.

use crate::distributed::ProcessGroup;
use crate::error::{Error, Result};
use crate::nn::ParamStore;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Replace every gradient with its mean over all ranks.
///
/// Parameters without a local gradient contribute zeros, so the packed
/// layout never depends on which parameters a rank happened to touch.
pub fn all_reduce_grads<R, P>(group: &P, params: &ParamStore<R>, grads: &mut GradStore<R>) -> Result<()>
where
    R: Runtime<DType = DType>,
    P: ProcessGroup + ?Sized,
{
    if group.world_size() <= 1 {
        return Ok(());
    }

    let mut layout = Vec::with_capacity(params.len());
    let mut flat: Vec<f32> = Vec::with_capacity(params.num_parameters());
    for (name, id) in params.names() {
        let param = params.get(id).ok_or_else(|| Error::DistributedError {
            reason: format!("parameter {name} vanished from the store"),
        })?;
        match grads.get(id) {
            Some(grad) => {
                if grad.shape() != param.shape() {
                    return Err(Error::DistributedError {
                        reason: format!(
                            "gradient shape {:?} does not match parameter {name} {:?}",
                            grad.shape(),
                            param.shape()
                        ),
                    });
                }
                flat.extend(grad.contiguous().to_vec::<f32>());
            }
            None => flat.extend(std::iter::repeat_n(0.0f32, param.numel())),
        }
        layout.push((id, param.shape().to_vec(), param.numel()));
    }

    group.all_reduce_mean(&mut flat)?;

    let mut offset = 0;
    for (id, shape, numel) in layout {
        let device = params
            .get(id)
            .map(|p| p.device().clone())
            .ok_or_else(|| Error::DistributedError {
                reason: "parameter vanished during gradient sync".into(),
            })?;
        let synced = Tensor::<R>::from_slice(&flat[offset..offset + numel], &shape, &device);
        grads.insert(id, synced);
        offset += numel;
    }
    Ok(())
}
