//! Attention-score kernels.
//!
//! Both kernels take batch-first `q: (B, L2, zdim)` and `k: (B, L1, zdim)`, add a relative
//! positional bias and return `(B, L2, L1)` weights. Neither holds state: when a step index is
//! given the query must be a single position and the bias row at that index is used.

use candle_core::{Result, Tensor};

use crate::{config::AttentionActivation, positional::PositionalBias};

mod relu2;
mod softmax;

pub use relu2::Relu2Attention;
pub use softmax::{SoftmaxAttention, SoftmaxMode};

#[derive(Debug, Clone)]
pub enum AttentionKernel {
    Softmax(SoftmaxAttention),
    Relu2(Relu2Attention),
}

impl AttentionKernel {
    pub fn new(activation: AttentionActivation, zdim: usize) -> Self {
        match activation {
            AttentionActivation::Softmax => Self::Softmax(SoftmaxAttention::new(zdim)),
            AttentionActivation::Relu2 => Self::Relu2(Relu2Attention),
        }
    }

    pub fn activation(&self) -> AttentionActivation {
        match self {
            Self::Softmax(_) => AttentionActivation::Softmax,
            Self::Relu2(_) => AttentionActivation::Relu2,
        }
    }

    /// Switch the softmax kernel to its export-friendly path. No-op for the other kernel.
    pub fn set_softmax_mode(&mut self, mode: SoftmaxMode) {
        if let Self::Softmax(kernel) = self {
            kernel.mode = mode;
        }
    }

    /// Attention weights, or the raw scores when `before_attn_fn` is set.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        key_padding_mask: Option<&Tensor>,
        pidx: Option<usize>,
        before_attn_fn: bool,
        bias: &dyn PositionalBias,
    ) -> Result<Tensor> {
        match self {
            Self::Softmax(kernel) => {
                kernel.forward(q, k, key_padding_mask, pidx, before_attn_fn, bias)
            }
            Self::Relu2(kernel) => kernel.forward(q, k, key_padding_mask, pidx, before_attn_fn, bias),
        }
    }
}

/// Bias for `slen` queries against `clen` keys: `(slen, clen)` in full mode, `(1, clen)`
/// holding row `pidx` in step mode.
pub(crate) fn slice_bias(
    bias: &dyn PositionalBias,
    slen: usize,
    clen: usize,
    pidx: Option<usize>,
) -> Result<Tensor> {
    match pidx {
        Some(pidx) => {
            if slen != 1 {
                candle_core::bail!(
                    "incremental attention expects a single query position, got {slen}"
                );
            }
            // L x L1
            let full = bias.lookup(clen.max(pidx + 1))?.narrow(1, 0, clen)?;
            // 1 x L1
            full.narrow(0, pidx, 1)
        }
        None => {
            let full = bias.lookup(slen.max(clen))?.narrow(1, 0, clen)?;
            // L2 x L1
            full.narrow(0, 0, slen)
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::slice_bias;
    use crate::positional::SimpleRelativePositionalBias;

    fn ramp(max_positions: usize) -> candle_core::Result<SimpleRelativePositionalBias> {
        let w = Tensor::arange(0f32, (2 * max_positions - 1) as f32, &Device::Cpu)?;
        SimpleRelativePositionalBias::from_weights(w)
    }

    #[test]
    fn full_slice_shape() -> candle_core::Result<()> {
        let bias = ramp(16)?;
        assert_eq!(slice_bias(&bias, 3, 5, None)?.dims(), &[3, 5]);
        assert_eq!(slice_bias(&bias, 6, 2, None)?.dims(), &[6, 2]);
        Ok(())
    }

    #[test]
    fn step_slice_matches_full_row() -> candle_core::Result<()> {
        let bias = ramp(16)?;
        let full = slice_bias(&bias, 4, 5, None)?.to_vec2::<f32>()?;
        for (t, expected) in full.iter().enumerate() {
            let row = slice_bias(&bias, 1, 5, Some(t))?.to_vec2::<f32>()?;
            assert_eq!(&row[0], expected);
        }
        // Steps past the context length still resolve.
        assert_eq!(slice_bias(&bias, 1, 2, Some(7))?.dims(), &[1, 2]);
        Ok(())
    }

    #[test]
    fn step_slice_rejects_multiple_queries_and_overflow() -> candle_core::Result<()> {
        let bias = ramp(4)?;
        assert!(slice_bias(&bias, 2, 3, Some(0)).is_err());
        assert!(slice_bias(&bias, 1, 3, Some(4)).is_err());
        assert!(slice_bias(&bias, 5, 3, None).is_err());
        Ok(())
    }
}
