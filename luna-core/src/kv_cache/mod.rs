//! Per-session state for incremental decoding.
//!
//! An [`IncrementalState`] is created by the caller at the start of a generation session and
//! handed to every forward call of one attention unit. The unit's own projections live in
//! [`AttentionCache`]; the contextualizer keeps its recurrent state in [`ContextState`], which
//! the unit never reads.

use candle_core::{Result, Tensor};

/// Cached context-side projections of one attention unit, all stored batch-first.
#[derive(Debug, Clone, Default)]
pub struct AttentionCache {
    /// `(batch, src_len, zdim)`
    pub prev_key: Option<Tensor>,
    /// `(batch, src_len, embed_dim)`
    pub prev_value: Option<Tensor>,
    /// `(batch, src_len)`
    pub prev_key_padding_mask: Option<Tensor>,
    /// Absolute position of the last decoded step.
    pub prev_num_steps: Option<usize>,
}

impl AttentionCache {
    pub fn is_empty(&self) -> bool {
        self.prev_key.is_none()
            && self.prev_value.is_none()
            && self.prev_key_padding_mask.is_none()
            && self.prev_num_steps.is_none()
    }

    /// Select batch rows by `new_order`. A cached tensor whose leading dimension differs from
    /// the length of `new_order` is left as is.
    pub fn reorder(&mut self, new_order: &Tensor) -> Result<()> {
        for buf in [
            &mut self.prev_key,
            &mut self.prev_value,
            &mut self.prev_key_padding_mask,
        ] {
            reorder_rows(buf, new_order)?;
        }
        Ok(())
    }
}

/// Recurrent state owned by the contextualizer, `(batch, ...)`.
#[derive(Debug, Clone, Default)]
pub struct ContextState {
    pub prev_state: Option<Tensor>,
}

impl ContextState {
    pub fn reorder(&mut self, new_order: &Tensor) -> Result<()> {
        reorder_rows(&mut self.prev_state, new_order)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalState {
    pub attn: AttentionCache,
    pub context: ContextState,
}

impl IncrementalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permute the batch axis of every cached tensor, e.g. after beam reordering.
    pub fn reorder(&mut self, new_order: &Tensor) -> Result<()> {
        self.attn.reorder(new_order)?;
        self.context.reorder(new_order)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn reorder_rows(buf: &mut Option<Tensor>, new_order: &Tensor) -> Result<()> {
    let n = new_order.dims1()?;
    if let Some(t) = buf.as_mut() {
        if t.rank() > 0 && t.dim(0)? == n {
            *t = t.index_select(new_order, 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::IncrementalState;

    #[test]
    fn reorder_permutes_batch_rows() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let mut state = IncrementalState::new();
        state.attn.prev_key = Some(Tensor::new(&[[[0f32]], [[1.]], [[2.]]], &dev)?);
        state.attn.prev_key_padding_mask = Some(Tensor::new(&[[0u8], [1], [0]], &dev)?);
        state.attn.prev_num_steps = Some(3);
        state.context.prev_state = Some(Tensor::new(&[[10f32], [11.], [12.]], &dev)?);

        let order = Tensor::new(&[2u32, 0, 1], &dev)?;
        state.reorder(&order)?;

        let k = state.attn.prev_key.as_ref().unwrap().flatten_all()?;
        assert_eq!(k.to_vec1::<f32>()?, vec![2., 0., 1.]);
        let m = state.attn.prev_key_padding_mask.as_ref().unwrap();
        assert_eq!(m.flatten_all()?.to_vec1::<u8>()?, vec![0, 0, 1]);
        let h = state.context.prev_state.as_ref().unwrap().flatten_all()?;
        assert_eq!(h.to_vec1::<f32>()?, vec![12., 10., 11.]);
        assert_eq!(state.attn.prev_num_steps, Some(3));
        Ok(())
    }

    #[test]
    fn reorder_skips_mismatched_batch() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let mut state = IncrementalState::new();
        let key = Tensor::arange(0f32, 4., &dev)?.reshape((2, 2, 1))?;
        state.attn.prev_key = Some(key.clone());
        state.reorder(&Tensor::new(&[2u32, 1, 0], &dev)?)?;
        let after = state.attn.prev_key.as_ref().unwrap();
        assert_eq!(
            after.flatten_all()?.to_vec1::<f32>()?,
            key.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn reset_clears_everything() -> candle_core::Result<()> {
        let mut state = IncrementalState::new();
        assert!(state.attn.is_empty());
        state.attn.prev_value = Some(Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu)?);
        state.attn.prev_num_steps = Some(0);
        assert!(!state.attn.is_empty());
        state.reset();
        assert!(state.attn.is_empty());
        assert!(state.context.prev_state.is_none());
        Ok(())
    }
}
