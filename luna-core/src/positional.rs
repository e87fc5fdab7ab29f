use std::fmt::Debug;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Content-independent score offsets indexed by (query position, key position).
pub trait PositionalBias: Debug + Send + Sync {
    /// Returns a `length x length` bias matrix. Must fail for `length > max_positions()`.
    fn lookup(&self, length: usize) -> Result<Tensor>;

    fn max_positions(&self) -> usize;
}

/// Learned relative bias: entry `(i, j)` only depends on the offset `j - i`.
#[derive(Debug, Clone)]
pub struct SimpleRelativePositionalBias {
    rel_pos_bias: Tensor,
    max_positions: usize,
}

impl SimpleRelativePositionalBias {
    pub fn new(max_positions: usize, vb: VarBuilder) -> Result<Self> {
        if max_positions == 0 {
            candle_core::bail!("max_positions must be strictly positive");
        }
        let rel_pos_bias = vb.get_with_hints(
            2 * max_positions - 1,
            "rel_pos_bias",
            Init::Randn {
                mean: 0.,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            rel_pos_bias,
            max_positions,
        })
    }

    pub fn from_weights(rel_pos_bias: Tensor) -> Result<Self> {
        let n = rel_pos_bias.dims1()?;
        if n % 2 == 0 {
            candle_core::bail!("relative bias must hold 2 * max_positions - 1 entries, got {n}");
        }
        Ok(Self {
            rel_pos_bias,
            max_positions: n.div_ceil(2),
        })
    }
}

impl PositionalBias for SimpleRelativePositionalBias {
    fn lookup(&self, length: usize) -> Result<Tensor> {
        if length > self.max_positions {
            candle_core::bail!(
                "sequence length {length} going beyond max length {}",
                self.max_positions
            );
        }
        // Toeplitz gather: bias[i][j] = w[max_positions - 1 + j - i]
        let center = self.max_positions - 1;
        let idx = (0..length)
            .flat_map(|i| (0..length).map(move |j| (center + j - i) as u32))
            .collect::<Vec<_>>();
        let idx = Tensor::from_vec(idx, length * length, self.rel_pos_bias.device())?;
        self.rel_pos_bias
            .index_select(&idx, 0)?
            .reshape((length, length))
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::{PositionalBias, SimpleRelativePositionalBias};

    fn ramp(max_positions: usize) -> candle_core::Result<SimpleRelativePositionalBias> {
        let n = 2 * max_positions - 1;
        let w = Tensor::arange(0f32, n as f32, &Device::Cpu)?;
        SimpleRelativePositionalBias::from_weights(w)
    }

    #[test]
    fn lookup_is_toeplitz() -> candle_core::Result<()> {
        let bias = ramp(8)?;
        assert_eq!(bias.max_positions(), 8);
        let m = bias.lookup(4)?.to_vec2::<f32>()?;
        for (i, row) in m.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                assert_eq!(*v, (7 + j - i) as f32);
            }
        }
        Ok(())
    }

    #[test]
    fn rows_do_not_depend_on_lookup_length() -> candle_core::Result<()> {
        let bias = ramp(8)?;
        let small = bias.lookup(3)?.to_vec2::<f32>()?;
        let large = bias.lookup(6)?.to_vec2::<f32>()?;
        for i in 0..3 {
            assert_eq!(small[i][..], large[i][..3]);
        }
        Ok(())
    }

    #[test]
    fn lookup_beyond_max_positions_fails() -> candle_core::Result<()> {
        let bias = ramp(4)?;
        assert!(bias.lookup(4).is_ok());
        assert!(bias.lookup(5).is_err());
        Ok(())
    }
}
