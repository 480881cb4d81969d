//! GELU activation (tanh approximation)

use crate::error::{Error, Result};
use crate::model::traits::ModelClient;
use numr::autograd::{Var, var_add, var_mul, var_mul_scalar, var_sigmoid};
use numr::dtype::DType;
use numr::runtime::Runtime;

/// `0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))`
///
/// Evaluated as `x * sigmoid(2u)`, which equals the tanh form exactly, using
/// only ops with autograd support.
pub fn gelu<R, C>(client: &C, x: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R>,
    R::Client: ModelClient<R>,
{
    let k = (2.0 / std::f64::consts::PI).sqrt();
    let x2 = var_mul(x, x, client).map_err(Error::Numr)?;
    let x3 = var_mul(&x2, x, client).map_err(Error::Numr)?;
    let cubic = var_mul_scalar(&x3, 0.044715, client).map_err(Error::Numr)?;
    let inner = var_add(x, &cubic, client).map_err(Error::Numr)?;
    let u2 = var_mul_scalar(&inner, 2.0 * k, client).map_err(Error::Numr)?;
    let gate = var_sigmoid(&u2, client).map_err(Error::Numr)?;
    var_mul(x, &gate, client).map_err(Error::Numr)
}
