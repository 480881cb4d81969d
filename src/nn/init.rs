//! Parameter initializers driven by the crate PRNG.
//!
//! Host-side generation keeps initialization bit-identical across workers and
//! backends: the same seed always yields the same weights.

use crate::data::SplitMix64;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// `N(0, std^2)` tensor.
pub fn normal_tensor<R: Runtime<DType = DType>>(
    shape: &[usize],
    std: f64,
    rng: &mut SplitMix64,
    device: &R::Device,
) -> Tensor<R> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| (rng.next_normal() * std) as f32).collect();
    Tensor::<R>::from_slice(&data, shape, device)
}

pub fn zeros_tensor<R: Runtime<DType = DType>>(shape: &[usize], device: &R::Device) -> Tensor<R> {
    Tensor::<R>::zeros(shape, DType::F32, device)
}

pub fn ones_tensor<R: Runtime<DType = DType>>(shape: &[usize], device: &R::Device) -> Tensor<R> {
    let n: usize = shape.iter().product();
    Tensor::<R>::from_slice(&vec![1.0f32; n], shape, device)
}
