//! Luna-style gated cross-attention.
//!
//! The central type is [`GatedCrossAttention`]: a single-head attention unit that smooths the
//! query with a [`Contextualizer`], attends over a context sequence with one of two
//! [`AttentionKernel`]s and blends the result back into the query through a learned gate. It
//! runs either over whole sequences or one step at a time against an [`IncrementalState`].

use std::sync::atomic::AtomicBool;

pub mod attention;
mod config;
mod ema;
mod gated_cross_attention;
pub mod kv_cache;
mod layers;
mod positional;
mod utils;

pub use attention::{AttentionKernel, Relu2Attention, SoftmaxAttention, SoftmaxMode};
pub use config::{AttentionActivation, ConfigError, GateActivation, GatedCrossAttentionConfig};
pub use ema::{Contextualizer, MultiHeadEma, EMA_CHUNK_SIZE};
pub use gated_cross_attention::{ForwardFlags, GatedAttentionOutput, GatedCrossAttention};
pub use kv_cache::{AttentionCache, ContextState, IncrementalState};
pub use layers::{masked_fill, normal_linear, padding_indicator, PROJ_INIT_STD};
pub use positional::{PositionalBias, SimpleRelativePositionalBias};
pub use utils::debug::initialize_logging;

pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);

/// Defines a zero-argument function returning a constant, for use with `#[serde(default = ...)]`.
#[macro_export]
macro_rules! serde_default_fn {
    ($t:ty, $name:ident, $v:expr) => {
        fn $name() -> $t {
            $v
        }
    };
}
