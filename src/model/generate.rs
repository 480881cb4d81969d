//! Greedy text continuation used for progress samples.

use crate::error::{Error, Result};
use crate::model::traits::{LanguageModel, ModelClient};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Extend `prompt` by `max_new_tokens` argmax tokens.
///
/// The model sees at most the last `context_size` tokens at each step.
/// Runs in whatever mode the model is currently in; callers switch to eval
/// first. Returns prompt followed by the generated ids.
pub fn generate_greedy<R, C, M>(
    model: &mut M,
    client: &C,
    prompt: &[u32],
    max_new_tokens: usize,
    context_size: usize,
) -> Result<Vec<u32>>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R>,
    R::Client: ModelClient<R>,
    M: LanguageModel<R>,
{
    if prompt.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "prompt",
            reason: "generation needs at least one prompt token".into(),
        });
    }
    let context_size = context_size.min(model.context_length()).max(1);
    let device = model.device().clone();
    let mut ids = prompt.to_vec();

    for _ in 0..max_new_tokens {
        let window = &ids[ids.len().saturating_sub(context_size)..];
        let input: Vec<i64> = window.iter().map(|&t| t as i64).collect();
        let tokens = Tensor::<R>::from_slice(&input, &[1, input.len()], &device);

        let logits = model.forward(client, &tokens)?;
        let shape = logits.shape();
        let vocab = shape[shape.len() - 1];
        let values = logits.tensor().to_vec::<f32>();
        let last = &values[values.len() - vocab..];

        let next = last
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 { (i, v) } else { best }
            })
            .0;
        ids.push(next as u32);
    }
    Ok(ids)
}
