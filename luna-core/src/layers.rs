use candle_core::{Result, Tensor, WithDType};
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::config::GateActivation;

/// Standard deviation of the normal init used by every projection of the unit.
pub const PROJ_INIT_STD: f64 = 0.02;

/// Affine layer with weight drawn from N(0, [`PROJ_INIT_STD`]²) and a zero bias.
///
/// The init hints only apply when the builder is backed by a `VarMap`, loading from
/// safetensors returns the stored weights unchanged.
pub fn normal_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.,
            stdev: PROJ_INIT_STD,
        },
    )?;
    let bs = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Replace every element of `xs` where `mask` is non-zero with `value`.
///
/// `mask` must be an integer tensor broadcastable to the shape of `xs`.
pub fn masked_fill<D: WithDType>(xs: &Tensor, mask: &Tensor, value: D) -> Result<Tensor> {
    let on_true = Tensor::full(value, xs.shape(), xs.device())?.to_dtype(xs.dtype())?;
    let on_false = xs;
    let res = mask
        .broadcast_as(xs.shape())?
        .where_cond(&on_true, on_false)?;
    Ok(res)
}

/// `u8` tensor holding 1 where `mask` is non-zero and 0 elsewhere, for masks of any dtype.
pub fn padding_indicator(mask: &Tensor) -> Result<Tensor> {
    mask.ne(0u8)
}

impl Module for GateActivation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Tanh => xs.tanh(),
            Self::Sin => xs.sin(),
        }
    }
}
