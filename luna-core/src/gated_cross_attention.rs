use std::fmt::Display;

use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use tracing::debug;

use crate::{
    attention::{AttentionKernel, SoftmaxMode},
    config::{GateActivation, GatedCrossAttentionConfig},
    ema::{Contextualizer, MultiHeadEma},
    kv_cache::IncrementalState,
    layers::normal_linear,
    positional::{PositionalBias, SimpleRelativePositionalBias},
    utils::debug::debug_enabled,
};

/// Per-call switches of [`GatedCrossAttention::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardFlags {
    /// Return the attention weights alongside the output.
    pub need_weights: bool,
    /// The context does not change between decoding steps, so cached projections are reused.
    pub static_kv: bool,
    /// Stop before the score normalisation and return the raw scores and values.
    pub before_attn_fn: bool,
    /// Enables both dropouts.
    pub train: bool,
}

#[derive(Debug, Clone)]
pub enum GatedAttentionOutput {
    Hidden {
        /// `(tgt_len, batch, embed_dim)`
        out: Tensor,
        /// `(batch, tgt_len, src_len)`, present when `need_weights` was set.
        attn_weights: Option<Tensor>,
    },
    RawScores {
        /// `(batch, tgt_len, src_len)`
        scores: Tensor,
        /// `(batch, src_len, embed_dim)`
        values: Tensor,
    },
}

impl GatedAttentionOutput {
    /// Output and optional weights, failing for [`GatedAttentionOutput::RawScores`].
    pub fn into_hidden(self) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Self::Hidden { out, attn_weights } => Ok((out, attn_weights)),
            Self::RawScores { .. } => {
                candle_core::bail!("expected attention output, got raw scores")
            }
        }
    }

    /// Raw scores and values, failing for [`GatedAttentionOutput::Hidden`].
    pub fn into_raw_scores(self) -> Result<(Tensor, Tensor)> {
        match self {
            Self::RawScores { scores, values } => Ok((scores, values)),
            Self::Hidden { .. } => candle_core::bail!("expected raw scores, got attention output"),
        }
    }
}

/// Gated cross-attention unit.
///
/// The query is smoothed by the contextualizer and projected into an update gate `u`, a reset
/// gate `r`, the attention query `q` and a candidate `hx`. Attention over the context produces
/// `h`, and the output interpolates between the query and `activation(hx + h_proj(h * r))`
/// with the gate `u`.
#[derive(Debug)]
pub struct GatedCrossAttention {
    embed_dim: usize,
    zdim: usize,
    ndim: usize,
    activation: GateActivation,
    kernel: AttentionKernel,
    attention_dropout: Dropout,
    hidden_dropout: Dropout,
    mover: Box<dyn Contextualizer>,
    k_proj: Linear,
    v_proj: Linear,
    mx_proj: Linear,
    h_proj: Linear,
    max_positions: usize,
    rel_pos_bias: Box<dyn PositionalBias>,
    span: tracing::Span,
}

impl GatedCrossAttention {
    /// Builds the unit with a [`MultiHeadEma`] contextualizer and a
    /// [`SimpleRelativePositionalBias`], both loaded from `vb`.
    pub fn new(cfg: &GatedCrossAttentionConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let mover = MultiHeadEma::new(
            cfg.embed_dim,
            cfg.ndim,
            cfg.bidirectional,
            cfg.truncation,
            vb.pp("move"),
        )?;
        let rel_pos_bias = SimpleRelativePositionalBias::new(cfg.max_positions, vb.pp("rel_pos_bias"))?;
        Self::with_collaborators(cfg, vb, Box::new(mover), Box::new(rel_pos_bias))
    }

    pub fn with_collaborators(
        cfg: &GatedCrossAttentionConfig,
        vb: VarBuilder,
        mover: Box<dyn Contextualizer>,
        rel_pos_bias: Box<dyn PositionalBias>,
    ) -> Result<Self> {
        cfg.validate()?;
        if rel_pos_bias.max_positions() < cfg.max_positions {
            candle_core::bail!(
                "positional bias covers {} positions, config asks for {}",
                rel_pos_bias.max_positions(),
                cfg.max_positions
            );
        }
        let embed_dim = cfg.embed_dim;
        let zdim = cfg.zdim;
        let k_proj = normal_linear(embed_dim, zdim, vb.pp("k_proj"))?;
        let v_proj = normal_linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let mx_proj = normal_linear(embed_dim, 3 * embed_dim + zdim, vb.pp("mx_proj"))?;
        let h_proj = normal_linear(embed_dim, embed_dim, vb.pp("h_proj"))?;

        debug!(
            "gated cross-attention: edim={embed_dim}, zdim={zdim}, attn_act={}, act={}",
            cfg.attention_activation, cfg.activation
        );

        Ok(Self {
            embed_dim,
            zdim,
            ndim: cfg.ndim,
            activation: cfg.activation,
            kernel: AttentionKernel::new(cfg.attention_activation, zdim),
            attention_dropout: Dropout::new(cfg.attention_dropout),
            hidden_dropout: Dropout::new(cfg.hidden_dropout),
            mover,
            k_proj,
            v_proj,
            mx_proj,
            h_proj,
            max_positions: cfg.max_positions,
            rel_pos_bias,
            span: tracing::span!(tracing::Level::TRACE, "gated-cross-attn"),
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn zdim(&self) -> usize {
        self.zdim
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn kernel(&self) -> &AttentionKernel {
        &self.kernel
    }

    /// Use the export-friendly softmax path.
    pub fn prepare_for_export(&mut self) {
        self.kernel.set_softmax_mode(SoftmaxMode::Traced);
    }

    /// Permute the batch axis of the session state, e.g. after beam reordering.
    pub fn reorder_incremental_state(
        &self,
        incremental_state: &mut IncrementalState,
        new_order: &Tensor,
    ) -> Result<()> {
        incremental_state.reorder(new_order)
    }

    /// Input shape: Time x Batch x Channel.
    ///
    /// `padding_mask` is `(batch, tgt_len)` and `key_padding_mask` `(batch, src_len)`, padding
    /// elements are marked with 1. Only `key` is projected; `value` has to be present exactly
    /// when `key` is.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: &Tensor,
        key: Option<&Tensor>,
        value: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        incremental_state: Option<&mut IncrementalState>,
        flags: ForwardFlags,
    ) -> Result<GatedAttentionOutput> {
        let _enter = self.span.enter();
        let (seq_len, bsz, embed_dim) = query.dims3()?;
        if embed_dim != self.embed_dim {
            candle_core::bail!(
                "query has {embed_dim} channels, attention was built for {}",
                self.embed_dim
            );
        }

        let mut key = match (key, value) {
            (Some(k), Some(v)) => {
                let (_, kb, kd) = k.dims3()?;
                if kd != self.embed_dim || kb != bsz {
                    candle_core::bail!(
                        "key has shape {:?}, expected (_, {bsz}, {})",
                        k.dims(),
                        self.embed_dim
                    );
                }
                if k.dims() != v.dims() {
                    candle_core::bail!(
                        "key {:?} and value {:?} shapes differ",
                        k.dims(),
                        v.dims()
                    );
                }
                Some(k)
            }
            (None, None) => None,
            _ => candle_core::bail!("key and value must be given together"),
        };

        // Preconditions are checked before the state is touched, and the state is only written
        // back once the call has succeeded.
        let mut pidx = None;
        let mut cached = None;
        if let Some(state) = incremental_state.as_deref() {
            if seq_len != 1 {
                candle_core::bail!(
                    "incremental attention expects a single query position, got {seq_len}"
                );
            }
            let saved = &state.attn;
            pidx = Some(saved.prev_num_steps.map_or(0, |steps| steps + 1));
            if let Some(prev_key) = &saved.prev_key {
                // previous time steps are cached - no need to recompute
                // key and value if they are static
                if !flags.static_kv {
                    candle_core::bail!("cached keys are only reusable with `static_kv`");
                }
                let Some(prev_value) = &saved.prev_value else {
                    candle_core::bail!("incremental state holds a key without a value");
                };
                key = None;
                cached = Some((
                    prev_key.clone(),
                    prev_value.clone(),
                    saved.prev_key_padding_mask.clone(),
                ));
            }
        }

        let (ctx_len, key_padding_mask) = match (key, &cached) {
            (Some(key), _) => (key.dim(0)?, key_padding_mask.cloned()),
            (None, Some((prev_key, _, prev_mask))) => (prev_key.dim(1)?, prev_mask.clone()),
            (None, None) => {
                candle_core::bail!("no key/value given and none cached, nothing to attend to")
            }
        };
        let key_padding_mask = key_padding_mask.filter(|m| m.rank() != 0);
        if let Some(mask) = &key_padding_mask {
            let (mb, ml) = mask.dims2()?;
            if mb != bsz || ml != ctx_len {
                candle_core::bail!(
                    "key padding mask has shape ({mb}, {ml}), expected ({bsz}, {ctx_len})"
                );
            }
        }
        if let Some(pidx) = pidx {
            let needed = ctx_len.max(pidx + 1);
            if needed > self.max_positions {
                candle_core::bail!(
                    "decoding step {pidx} over {ctx_len} context positions goes beyond max length {}",
                    self.max_positions
                );
            }
        }

        // The contextualizer advances a copy of its state.
        let mut context = incremental_state.as_deref().map(|s| s.context.clone());

        // L2 x B x D
        let mx = self.mover.forward(query, padding_mask, context.as_mut())?;
        let mx = self.hidden_dropout.forward(&mx, flags.train)?;

        // L2 x B x (3*D+S)
        let base = self.mx_proj.forward(&mx)?;
        let u = base.narrow(D::Minus1, 0, self.embed_dim)?;
        let r = base.narrow(D::Minus1, self.embed_dim, self.embed_dim)?;
        let q = base.narrow(D::Minus1, 2 * self.embed_dim, self.zdim)?;
        let hx = base.narrow(D::Minus1, 2 * self.embed_dim + self.zdim, self.embed_dim)?;

        // L2 x B x D
        let u = candle_nn::ops::sigmoid(&u)?;
        let r = r.silu()?;

        // saved states are stored with shape (bsz, seq_len, dim)
        let (k, v) = match (key, cached) {
            // L1 x B x S -> B x L1 x S
            (Some(key), _) => (
                self.k_proj.forward(key)?.transpose(0, 1)?,
                self.v_proj.forward(key)?.silu()?.transpose(0, 1)?,
            ),
            (None, Some((prev_key, prev_value, _))) => (prev_key, prev_value),
            (None, None) => {
                candle_core::bail!("no key/value given and none cached, nothing to attend to")
            }
        };
        // L2 x B x S -> B x L2 x S
        let q = q.transpose(0, 1)?;

        if debug_enabled() {
            debug!(
                "gated cross-attn: tgt_len={seq_len}, src_len={ctx_len}, bsz={bsz}, step={pidx:?}"
            );
        }

        let attn_weights = self.kernel.forward(
            &q,
            &k,
            key_padding_mask.as_ref(),
            pidx,
            flags.before_attn_fn,
            self.rel_pos_bias.as_ref(),
        )?;

        let output = if flags.before_attn_fn {
            GatedAttentionOutput::RawScores {
                scores: attn_weights,
                values: v.clone(),
            }
        } else {
            let kernel = self.attention_dropout.forward(&attn_weights, flags.train)?;
            // B x L2 x D -> L2 x B x D
            let h = kernel.matmul(&v.contiguous()?)?.transpose(0, 1)?;
            let h = self.hidden_dropout.forward(&h, flags.train)?;
            // L2 x B x D
            let h = self
                .activation
                .forward(&hx.add(&self.h_proj.forward(&h.mul(&r)?)?)?)?;
            GatedAttentionOutput::Hidden {
                out: gated_blend(query, &u, &h)?,
                attn_weights: flags.need_weights.then_some(attn_weights),
            }
        };

        if let (Some(state), Some(context)) = (incremental_state, context) {
            state.attn.prev_key = Some(k);
            state.attn.prev_value = Some(v);
            state.attn.prev_key_padding_mask = key_padding_mask;
            state.attn.prev_num_steps = pidx;
            state.context = context;
        }

        Ok(output)
    }
}

/// `query + u * (hidden - query)`
fn gated_blend(query: &Tensor, u: &Tensor, hidden: &Tensor) -> Result<Tensor> {
    query.add(&u.mul(&hidden.sub(query)?)?)
}

impl Display for GatedCrossAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "edim={}, zdim={}, ndim={}, attn_act={}",
            self.embed_dim,
            self.zdim,
            self.ndim,
            self.kernel.activation()
        )
    }
}
