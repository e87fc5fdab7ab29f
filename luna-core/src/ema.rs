use std::fmt::Debug;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{kv_cache::ContextState, layers::padding_indicator};

/// Default number of positions per block of the chunked scan.
pub const EMA_CHUNK_SIZE: usize = 64;

/// Smooths a `(time, batch, channel)` sequence into a same-shaped sequence.
///
/// Implementations that support step-wise execution keep their recurrent state in the
/// [`ContextState`] they are handed, and must produce the same values step by step as
/// over the full sequence.
pub trait Contextualizer: Debug + Send + Sync {
    fn forward(
        &self,
        xs: &Tensor,
        padding_mask: Option<&Tensor>,
        state: Option<&mut ContextState>,
    ) -> Result<Tensor>;
}

/// Multi-dimensional damped exponential moving average.
///
/// Each of the `embed_dim` channels is expanded into `ndim` EMA components with learned decay,
/// mixed back down with `gamma` and followed by a SiLU. Full sequences are processed in blocks
/// of `chunk_size` positions: a small convolution inside each block plus the recurrent state
/// carried across blocks, so memory grows linearly with the length. Truncated kernels have no
/// recurrent form and fall back to one windowed convolution over the whole sequence.
#[derive(Debug, Clone)]
pub struct MultiHeadEma {
    delta: Tensor,
    alpha: Tensor,
    beta: Tensor,
    gamma: Tensor,
    omega: Tensor,
    embed_dim: usize,
    bidirectional: bool,
    truncation: Option<usize>,
    scale: f64,
    chunk_size: usize,
}

/// Per-direction recurrence coefficients, each `(embed_dim, ndim)`.
struct Direction {
    /// Decay `q`, kept in log space.
    log_q: Tensor,
    /// Input weight `p * beta`.
    pb: Tensor,
    /// Output mix `scale * gamma`.
    gamma: Tensor,
}

impl MultiHeadEma {
    pub fn new(
        embed_dim: usize,
        ndim: usize,
        bidirectional: bool,
        truncation: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kernel_dim = if bidirectional {
            2 * embed_dim
        } else {
            embed_dim
        };
        let randn = |stdev| Init::Randn { mean: 0., stdev };
        let delta = vb.get_with_hints((kernel_dim, ndim, 1), "delta", randn(0.2))?;
        let alpha = vb.get_with_hints((kernel_dim, ndim, 1), "alpha", randn(0.2))?;
        let beta = vb.get_with_hints(
            (kernel_dim, ndim, 1),
            "beta",
            Init::Randn {
                mean: 1.,
                stdev: 0.02,
            },
        )?;
        let gamma = vb.get_with_hints((kernel_dim, ndim), "gamma", randn(1.0))?;
        let omega = vb.get_with_hints(embed_dim, "omega", randn(1.0))?;
        Ok(Self {
            delta,
            alpha,
            beta,
            gamma,
            omega,
            embed_dim,
            bidirectional,
            truncation,
            scale: (1.0 / ndim as f64).sqrt(),
            chunk_size: EMA_CHUNK_SIZE,
        })
    }

    /// Block length of the full-sequence scan. Only affects speed and memory.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Returns `(p, q)`, each `(kernel_dim, ndim, 1)`.
    fn coeffs(&self) -> Result<(Tensor, Tensor)> {
        let p = candle_nn::ops::sigmoid(&self.delta)?;
        let alpha = candle_nn::ops::sigmoid(&self.alpha)?;
        let q = p.mul(&alpha)?.affine(-1., 1.)?;
        Ok((p, q))
    }

    /// Coefficients of the forward (`backward == false`) or backward half of the kernel.
    fn direction(&self, backward: bool) -> Result<Direction> {
        let (p, q) = self.coeffs()?;
        let offset = if backward { self.embed_dim } else { 0 };
        let rows = |t: &Tensor| t.narrow(0, offset, self.embed_dim);
        Ok(Direction {
            log_q: rows(&q)?.squeeze(2)?.log()?,
            pb: rows(&p.mul(&self.beta)?)?.squeeze(2)?,
            gamma: rows(&self.gamma)?.affine(self.scale, 0.)?,
        })
    }

    /// EMA kernel `(kernel_dim, len)`: `k[d, l] = sum_n scale * gamma * beta * p * q^l`.
    fn kernel(&self, len: usize) -> Result<Tensor> {
        let (p, q) = self.coeffs()?;
        let vander = q.log()?.broadcast_mul(&positions(len, p.dtype(), p.device())?)?.exp()?;
        let kernel = p.mul(&self.beta)?.broadcast_mul(&vander)?;
        let gamma = self.gamma.affine(self.scale, 0.)?.unsqueeze(2)?;
        kernel.broadcast_mul(&gamma)?.sum(1)
    }

    /// Full-sequence path. `xs` is `(time, batch, channel)` with padding already zeroed.
    fn conv(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        match self.truncation {
            Some(window) if window < seq_len => self.windowed_conv(xs, window),
            _ => {
                let fwd = self.causal_scan(xs, &self.direction(false)?)?;
                if !self.bidirectional {
                    return Ok(fwd);
                }
                // the anti-causal half is the causal scan of the reversed sequence
                let bwd = self.causal_scan(&reverse_time(xs)?, &self.direction(true)?)?;
                fwd.add(&reverse_time(&bwd)?)
            }
        }
    }

    /// Convolution with the kernel cut after `window` lags, `(D, L, L)` weights.
    fn windowed_conv(&self, xs: &Tensor, window: usize) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        let kernel = self.kernel(seq_len)?;
        let weights = if self.bidirectional {
            let fwd = kernel.narrow(0, 0, self.embed_dim)?;
            let bwd = kernel.narrow(0, self.embed_dim, self.embed_dim)?;
            toeplitz(&fwd, window, false)?.add(&toeplitz(&bwd, window, true)?)?
        } else {
            toeplitz(&kernel, window, false)?
        };
        // (D, L, L) x (D, L, B) -> (D, L, B)
        let xs = xs.permute((2, 0, 1))?.contiguous()?;
        weights.matmul(&xs)?.permute((1, 2, 0))
    }

    /// Causal EMA over `(time, batch, channel)` in blocks of `chunk_size` positions.
    ///
    /// Inside a block the output is a convolution with the first `chunk_size` kernel taps; the
    /// state `h` entering the block adds `sum_n gamma * q^(t+1) * h` at offset `t`.
    fn causal_scan(&self, xs: &Tensor, dir: &Direction) -> Result<Tensor> {
        let (seq_len, _, _) = xs.dims3()?;
        let chunk = self.chunk_size.min(seq_len);
        let (dtype, device) = (dir.log_q.dtype(), xs.device());
        let log_q = dir.log_q.unsqueeze(2)?;

        // (D, N, C + 1), q^t for t in 0..=C
        let powers = log_q.broadcast_mul(&positions(chunk + 1, dtype, device)?)?.exp()?;
        // (D, C)
        let kernel = dir
            .gamma
            .mul(&dir.pb)?
            .unsqueeze(2)?
            .broadcast_mul(&powers.narrow(2, 0, chunk)?)?
            .sum(1)?;
        let weights = toeplitz(&kernel, chunk, false)?;

        let mut h: Option<Tensor> = None;
        let mut ys = Vec::with_capacity(seq_len.div_ceil(chunk));
        let mut start = 0;
        while start < seq_len {
            let len = chunk.min(seq_len - start);
            // (D, len, B)
            let x = xs.narrow(0, start, len)?.permute((2, 0, 1))?.contiguous()?;
            let w = weights.narrow(1, 0, len)?.narrow(2, 0, len)?.contiguous()?;
            let mut y = w.matmul(&x)?;

            // (D, N, len), weight of x_t in the state leaving the block: pb * q^(len-1-t)
            let fold = log_q
                .broadcast_mul(&positions(len, dtype, device)?.affine(-1., (len - 1) as f64)?)?
                .exp()?
                .broadcast_mul(&dir.pb.unsqueeze(2)?)?;
            // (D, N, len) x (D, len, B) -> (B, D, N)
            let h_block = fold.contiguous()?.matmul(&x)?.permute((2, 0, 1))?;

            let h_next = match &h {
                Some(h) => {
                    // (D, len, N) x (D, N, B) -> (D, len, B)
                    let decay = powers
                        .narrow(2, 1, len)?
                        .broadcast_mul(&dir.gamma.unsqueeze(2)?)?
                        .transpose(1, 2)?
                        .contiguous()?;
                    let carried = decay.matmul(&h.permute((1, 2, 0))?.contiguous()?)?;
                    y = y.add(&carried)?;
                    // (D, N) -> (1, D, N)
                    let q_len = powers.narrow(2, len, 1)?.squeeze(2)?.unsqueeze(0)?;
                    h.broadcast_mul(&q_len)?.add(&h_block)?
                }
                None => h_block,
            };
            h = Some(h_next);
            // (D, len, B) -> (len, B, D)
            ys.push(y.permute((1, 2, 0))?);
            start += len;
        }
        Tensor::cat(&ys, 0)
    }

    /// Recurrent path: `h <- q * h + p * beta * x`, `y = sum_n scale * gamma * h`.
    fn step(&self, xs: &Tensor, state: &mut ContextState) -> Result<Tensor> {
        let (seq_len, _, _) = xs.dims3()?;
        let dir = self.direction(false)?;
        let q = dir.log_q.exp()?;

        let mut h = state.prev_state.clone();
        let mut ys = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            // (B, D, 1) * (D, N) -> (B, D, N)
            let x_t = xs.get(t)?.unsqueeze(2)?;
            let update = x_t.broadcast_mul(&dir.pb)?;
            let h_t = match h {
                Some(prev) => prev.broadcast_mul(&q)?.add(&update)?,
                None => update,
            };
            ys.push(h_t.broadcast_mul(&dir.gamma)?.sum(2)?);
            h = Some(h_t);
        }
        let ys = Tensor::stack(&ys, 0)?;
        state.prev_state = h;
        Ok(ys)
    }
}

/// `(1, 1, len)` ramp `0..len`.
fn positions(len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::arange(0u32, len as u32, device)?
        .to_dtype(dtype)?
        .reshape((1, 1, len))
}

fn reverse_time(xs: &Tensor) -> Result<Tensor> {
    let len = xs.dim(0)?;
    let idx = Tensor::from_vec((0..len as u32).rev().collect::<Vec<_>>(), len, xs.device())?;
    xs.index_select(&idx, 0)
}

/// Gathers a `(D, L, L)` matrix with `T[d, t, j] = kernel[d, |t - j|]` on the causal
/// (`j <= t`) or anti-causal (`j >= t`) side and zero elsewhere or beyond `window` lags.
fn toeplitz(kernel: &Tensor, window: usize, anti_causal: bool) -> Result<Tensor> {
    let (dim, len) = kernel.dims2()?;
    let zero = Tensor::zeros((dim, 1), kernel.dtype(), kernel.device())?;
    let padded = Tensor::cat(&[kernel, &zero], 1)?;
    let idx = (0..len)
        .flat_map(|t| {
            (0..len).map(move |j| {
                let lag = if anti_causal {
                    j.checked_sub(t)
                } else {
                    t.checked_sub(j)
                };
                match lag {
                    Some(lag) if lag < window => lag as u32,
                    _ => len as u32,
                }
            })
        })
        .collect::<Vec<_>>();
    let idx = Tensor::from_vec(idx, len * len, &Device::Cpu)?.to_device(kernel.device())?;
    padded.index_select(&idx, 1)?.reshape((dim, len, len))
}

impl Contextualizer for MultiHeadEma {
    fn forward(
        &self,
        xs: &Tensor,
        padding_mask: Option<&Tensor>,
        state: Option<&mut ContextState>,
    ) -> Result<Tensor> {
        let (seq_len, bsz, embed_dim) = xs.dims3()?;
        if embed_dim != self.embed_dim {
            candle_core::bail!(
                "ema: expected {} channels, got {embed_dim}",
                self.embed_dim
            );
        }
        if state.is_some() && self.bidirectional {
            candle_core::bail!("bidirectional EMA does not support incremental state");
        }
        let residual = xs.broadcast_mul(&self.omega)?;

        let xs = match padding_mask {
            Some(mask) => {
                // (B, L) -> (L, B, 1)
                let keep = padding_indicator(mask)?
                    .to_dtype(DType::F32)?
                    .affine(-1., 1.)?
                    .to_dtype(xs.dtype())?
                    .t()?
                    .reshape((seq_len, bsz, 1))?;
                xs.broadcast_mul(&keep)?
            }
            None => xs.clone(),
        };

        let out = match state {
            Some(state) => self.step(&xs, state)?,
            None => self.conv(&xs)?,
        };
        out.add(&residual)?.silu()
    }
}
