use candle_core::{DType, Result, Tensor, D};

use crate::{
    layers::{masked_fill, padding_indicator},
    positional::PositionalBias,
};

use super::slice_bias;

/// Numerical strategy of the row normalisation. Both give the same weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoftmaxMode {
    /// Fused `softmax_last_dim`.
    #[default]
    Fused,
    /// Max-subtracted exponentials in f32, built from primitive ops only. Used for exported or
    /// traced graphs where the fused op is unavailable.
    Traced,
}

/// Scaled dot product plus positional bias, masked with `-inf` and normalised per row.
///
/// A query row whose context positions are all padding gets all-zero weights.
#[derive(Debug, Clone)]
pub struct SoftmaxAttention {
    pub(crate) scaling: f64,
    pub(crate) mode: SoftmaxMode,
}

impl SoftmaxAttention {
    pub fn new(zdim: usize) -> Self {
        Self {
            scaling: (zdim as f64).powf(-0.5),
            mode: SoftmaxMode::default(),
        }
    }

    pub fn mode(&self) -> SoftmaxMode {
        self.mode
    }

    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        key_padding_mask: Option<&Tensor>,
        pidx: Option<usize>,
        before_attn_fn: bool,
        bias: &dyn PositionalBias,
    ) -> Result<Tensor> {
        let (_bsz, clen, _) = k.dims3()?;
        let slen = q.dim(1)?;

        let bias = slice_bias(bias, slen, clen, pidx)?;

        let q = q.affine(self.scaling, 0.)?;
        // B x L2 x L1
        let qk = q
            .contiguous()?
            .matmul(&k.t()?.contiguous()?)?
            .broadcast_add(&bias)?;

        let mask = match key_padding_mask {
            // B x 1 x L1, 1 for padding
            Some(mask) => Some(padding_indicator(mask)?.unsqueeze(1)?),
            None => None,
        };
        let qk = match &mask {
            Some(mask) => masked_fill(&qk, mask, f32::NEG_INFINITY)?,
            None => qk,
        };

        if before_attn_fn {
            return Ok(qk);
        }

        match &mask {
            Some(mask) => {
                // B x 1 x 1, 1 where at least one context position is valid
                let row_valid = mask
                    .to_dtype(DType::F32)?
                    .min_keepdim(D::Minus1)?
                    .affine(-1., 1.)?;
                let fully_masked = row_valid.affine(-1., 1.)?.to_dtype(DType::U8)?;
                let qk = masked_fill(&qk, &fully_masked, 0f32)?;
                self.normalize(&qk)?
                    .broadcast_mul(&row_valid.to_dtype(qk.dtype())?)
            }
            None => self.normalize(&qk),
        }
    }

    fn normalize(&self, qk: &Tensor) -> Result<Tensor> {
        match self.mode {
            SoftmaxMode::Fused => candle_nn::ops::softmax_last_dim(qk),
            SoftmaxMode::Traced => {
                let dtype = qk.dtype();
                let qk = qk.to_dtype(DType::F32)?;
                let max = qk.max_keepdim(D::Minus1)?;
                let exp = qk.broadcast_sub(&max)?.exp()?;
                let sum = exp.sum_keepdim(D::Minus1)?;
                exp.broadcast_div(&sum)?.to_dtype(dtype)
            }
        }
    }
}
