use candle_core::{DType, Result, Tensor, D};

use crate::{layers::padding_indicator, positional::PositionalBias};

use super::slice_bias;

/// Length-normalised dot product plus positional bias, passed through `relu(x)^2`.
///
/// Weights are non-negative and are not normalised per row. Padded context columns are
/// multiplied out, so their weight is exactly zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu2Attention;

impl Relu2Attention {
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        key_padding_mask: Option<&Tensor>,
        pidx: Option<usize>,
        before_attn_fn: bool,
        bias: &dyn PositionalBias,
    ) -> Result<Tensor> {
        let (bsz, clen, _) = k.dims3()?;
        let slen = q.dim(1)?;

        let inverse_mask = match key_padding_mask {
            // B x L1
            Some(mask) => Some(
                padding_indicator(mask)?
                    .to_dtype(DType::F32)?
                    .affine(-1., 1.)?
                    .to_dtype(q.dtype())?,
            ),
            None => None,
        };

        let bias = slice_bias(bias, slen, clen, pidx)?;

        // B x L2 x L1
        let qk = q.contiguous()?.matmul(&k.t()?.contiguous()?)?;
        let qk = match &inverse_mask {
            Some(inverse_mask) => {
                // B x 1 x 1. Clamped so a fully padded row stays finite, it is zeroed below.
                let lengths = inverse_mask
                    .sum_keepdim(D::Minus1)?
                    .clamp(1f32, f32::MAX)?
                    .reshape((bsz, 1, 1))?;
                qk.broadcast_div(&lengths)?
            }
            None => qk.affine(1. / clen as f64, 0.)?,
        };
        let qk = qk.broadcast_add(&bias)?;

        let qk = match &inverse_mask {
            Some(inverse_mask) => qk.broadcast_mul(&inverse_mask.unsqueeze(1)?)?,
            None => qk,
        };

        if before_attn_fn {
            return Ok(qk);
        }

        qk.relu()?.sqr()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::Relu2Attention;
    use crate::positional::{PositionalBias, SimpleRelativePositionalBias};

    fn bias() -> candle_core::Result<SimpleRelativePositionalBias> {
        let w = Tensor::randn(0f32, 0.1, 31, &Device::Cpu)?;
        SimpleRelativePositionalBias::from_weights(w)
    }

    #[test]
    fn weights_are_non_negative_and_masked_columns_zero() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (2, 3, 4), &dev)?;
        let k = Tensor::randn(0f32, 1., (2, 4, 4), &dev)?;
        let mask = Tensor::new(&[[0u8, 0, 0, 1], [0, 1, 0, 1]], &dev)?;
        let w = Relu2Attention.forward(&q, &k, Some(&mask), None, false, &bias()?)?;
        let w = w.to_vec3::<f32>()?;
        for (b, rows) in w.iter().enumerate() {
            for row in rows {
                assert!(row.iter().all(|v| *v >= 0.0));
                assert_eq!(row[3], 0.0);
                if b == 1 {
                    assert_eq!(row[1], 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn unmasked_scores_average_over_context() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (1, 2, 4), &dev)?;
        let k = Tensor::randn(0f32, 1., (1, 5, 4), &dev)?;
        let bias = bias()?;
        let scores = Relu2Attention.forward(&q, &k, None, None, true, &bias)?;
        let expected = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(0.2, 0.)?
            .broadcast_add(&bias.lookup(5)?.narrow(0, 0, 2)?)?;
        let diff = scores
            .sub(&expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn any_non_zero_mask_value_pads() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (1, 2, 4), &dev)?;
        let k = Tensor::randn(0f32, 1., (1, 4, 4), &dev)?;
        let bias = bias()?;
        let binary = Tensor::new(&[[0u8, 0, 1, 1]], &dev)?;
        let wide = Tensor::new(&[[0u8, 0, 2, 9]], &dev)?;
        let a = Relu2Attention.forward(&q, &k, Some(&binary), None, true, &bias)?;
        let b = Relu2Attention.forward(&q, &k, Some(&wide), None, true, &bias)?;
        assert_eq!(a.to_vec3::<f32>()?, b.to_vec3::<f32>()?);
        for row in &b.to_vec3::<f32>()?[0] {
            assert_eq!(row[2], 0.0);
            assert_eq!(row[3], 0.0);
        }
        Ok(())
    }

    #[test]
    fn fully_padded_row_is_zero() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (1, 2, 4), &dev)?;
        let k = Tensor::randn(0f32, 1., (1, 3, 4), &dev)?;
        let mask = Tensor::new(&[[1u8, 1, 1]], &dev)?;
        let w = Relu2Attention.forward(&q, &k, Some(&mask), None, false, &bias()?)?;
        let w = w.flatten_all()?.to_vec1::<f32>()?;
        assert!(w.iter().all(|v| *v == 0.0));
        Ok(())
    }
}
