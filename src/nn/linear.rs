//! Dense linear layer

use crate::data::SplitMix64;
use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use crate::nn::init::{normal_tensor, zeros_tensor};
use crate::nn::params::ParamStore;
use numr::autograd::{Var, var_add, var_matmul, var_narrow, var_reshape, var_transpose};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;

/// output = input @ weight^T + bias
///
/// weight: `[out_features, in_features]`, bias: `[out_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: TensorId,
    bias: Option<TensorId>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Register `{name}.weight` (normal, std 0.02) and optionally `{name}.bias` (zeros).
    pub fn init<R: Runtime<DType = DType>>(
        store: &mut ParamStore<R>,
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Result<Self> {
        let weight = store.register(
            format!("{name}.weight"),
            normal_tensor::<R>(&[out_features, in_features], 0.02, rng, device),
        )?;
        let bias = if bias {
            Some(store.register(format!("{name}.bias"), zeros_tensor::<R>(&[out_features], device))?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Forward over all output features.
    ///
    /// input: `[..., in_features]`, output: `[..., out_features]`
    pub fn forward<R, C>(&self, client: &C, store: &ParamStore<R>, input: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let weight = store.var(self.weight)?;
        let bias = self.bias.map(|id| store.var(id)).transpose()?;
        affine(client, input, &weight, bias.as_ref())
    }

    /// Forward over the output feature rows `[start, start + len)` only.
    ///
    /// Row slices of a row-major weight are contiguous, which lets attention
    /// project one head at a time.
    pub fn forward_rows<R, C>(
        &self,
        client: &C,
        store: &ParamStore<R>,
        input: &Var<R>,
        start: usize,
        len: usize,
    ) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        if start + len > self.out_features {
            return Err(Error::InvalidArgument {
                arg: "len",
                reason: format!(
                    "rows [{start}, {}) exceed {} output features",
                    start + len,
                    self.out_features
                ),
            });
        }
        let weight = var_narrow(&store.var(self.weight)?, 0, start, len).map_err(Error::Numr)?;
        let bias = match self.bias {
            Some(id) => Some(var_narrow(&store.var(id)?, 0, start, len).map_err(Error::Numr)?),
            None => None,
        };
        affine(client, input, &weight, bias.as_ref())
    }

    pub fn weight_id(&self) -> TensorId {
        self.weight
    }

    pub fn bias_id(&self) -> Option<TensorId> {
        self.bias
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

fn affine<R, C>(client: &C, input: &Var<R>, weight: &Var<R>, bias: Option<&Var<R>>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R>,
    R::Client: ModelClient<R>,
{
    let shape = input.shape().to_vec();
    let Some((&in_features, lead)) = shape.split_last() else {
        return Err(Error::InvalidArgument {
            arg: "input",
            reason: "linear input must have at least one dim".into(),
        });
    };
    let rows: usize = lead.iter().product();
    let out_features = weight.shape()[0];

    // 2-D matmul only: numr's batched matmul backward leaves the weight
    // gradient unreduced over the batch
    let flat = var_reshape(input, &[rows, in_features]).map_err(Error::Numr)?;
    let w_t = var_transpose(weight).map_err(Error::Numr)?;
    let output = var_matmul(&flat, &w_t, client).map_err(Error::Numr)?;
    let output = match bias {
        Some(bias) => var_add(&output, bias, client).map_err(Error::Numr)?,
        None => output,
    };

    let mut out_shape = lead.to_vec();
    out_shape.push(out_features);
    var_reshape(&output, &out_shape).map_err(Error::Numr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    fn store_with(weight: &[f32], shape: &[usize], bias: Option<&[f32]>) -> (ParamStore<CpuRuntime>, Linear) {
        let (_, device) = cpu_setup();
        let mut store = ParamStore::new();
        let mut rng = SplitMix64::new(0);
        let linear = Linear::init(&mut store, "l", shape[1], shape[0], bias.is_some(), &mut rng, &device).unwrap();
        store
            .replace("l.weight", Tensor::<CpuRuntime>::from_slice(weight, shape, &device))
            .unwrap();
        if let Some(b) = bias {
            store
                .replace("l.bias", Tensor::<CpuRuntime>::from_slice(b, &[shape[0]], &device))
                .unwrap();
        }
        (store, linear)
    }

    #[test]
    fn test_linear_output_shape() {
        let (client, device) = cpu_setup();
        let (store, linear) = store_with(&[1.0f32; 12], &[4, 3], None);
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32; 6], &[2, 3], &device),
            false,
        );
        let out = linear.forward(&client, &store, &input).unwrap();
        assert_eq!(out.shape(), &[2, 4]);
    }

    #[test]
    fn test_linear_with_bias() {
        let (client, device) = cpu_setup();
        let (store, linear) = store_with(&[1.0, 0.0, 0.0, 1.0], &[2, 2], Some(&[10.0, 20.0]));
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[1, 2], &device),
            false,
        );
        let out = linear.forward(&client, &store, &input).unwrap();
        assert_eq!(out.tensor().to_vec::<f32>(), vec![11.0, 22.0]);
    }

    #[test]
    fn test_forward_rows_matches_slice_of_full() {
        let (client, device) = cpu_setup();
        #[rustfmt::skip]
        let w = [
            1.0f32, 0.0,
            0.0, 1.0,
            2.0, 3.0,
        ];
        let (store, linear) = store_with(&w, &[3, 2], Some(&[0.5, -0.5, 1.0]));
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[1, 2, 2], &device),
            false,
        );
        let full = linear.forward(&client, &store, &input).unwrap().tensor().to_vec::<f32>();
        let rows = linear
            .forward_rows(&client, &store, &input, 1, 2)
            .unwrap();
        assert_eq!(rows.shape(), &[1, 2, 2]);
        let rows = rows.tensor().contiguous().to_vec::<f32>();
        assert_eq!(rows, vec![full[1], full[2], full[4], full[5]]);
    }

    #[test]
    fn test_weight_gradient_summed_over_batch() {
        let (client, device) = cpu_setup();
        let (store, linear) = store_with(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], Some(&[0.0, 0.0]));
        // two batches, one position each
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 1, 2], &device),
            false,
        );
        let out = linear.forward(&client, &store, &input).unwrap();
        assert_eq!(out.shape(), &[2, 1, 2]);
        let loss = numr::autograd::var_sum(&out, &[0, 1, 2], false, &client).unwrap();
        let grads = numr::autograd::backward(&loss, &client).unwrap();

        let dw = grads.get(linear.weight_id()).expect("weight gradient");
        assert_eq!(dw.shape(), &[2, 2]);
        // d(sum)/dW[o, i] = sum over rows of input[.., i]
        assert_eq!(dw.contiguous().to_vec::<f32>(), vec![4.0, 6.0, 4.0, 6.0]);
        let db = grads.get(linear.bias_id().unwrap()).expect("bias gradient");
        assert_eq!(db.contiguous().to_vec::<f32>(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_forward_rows_out_of_range() {
        let (client, device) = cpu_setup();
        let (store, linear) = store_with(&[1.0f32; 4], &[2, 2], None);
        let input = Var::new(Tensor::<CpuRuntime>::from_slice(&[1.0f32; 2], &[1, 2], &device), false);
        assert!(linear.forward_rows(&client, &store, &input, 1, 2).is_err());
    }
}
