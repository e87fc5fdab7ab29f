use std::{fmt::Display, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde_default_fn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown gate activation `{0}`, expected one of `tanh`, `sin`")]
    UnknownActivation(String),
    #[error("unknown attention activation `{0}`, expected one of `softmax`, `relu2`")]
    UnknownAttentionActivation(String),
    #[error("`{name}` must be strictly positive, got {value}")]
    NotPositive { name: &'static str, value: usize },
    #[error("`zdim` ({zdim}) must not exceed `embed_dim` ({embed_dim})")]
    ZdimTooLarge { zdim: usize, embed_dim: usize },
    #[error("`{name}` must lie in [0, 1), got {value}")]
    InvalidProbability { name: &'static str, value: f32 },
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for candle_core::Error {
    fn from(e: ConfigError) -> Self {
        candle_core::Error::Msg(e.to_string())
    }
}

/// Nonlinearity applied to the candidate hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateActivation {
    #[default]
    Tanh,
    #[serde(alias = "sine")]
    Sin,
}

impl FromStr for GateActivation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tanh" => Ok(Self::Tanh),
            "sin" | "sine" => Ok(Self::Sin),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

impl Display for GateActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tanh => write!(f, "tanh"),
            Self::Sin => write!(f, "sin"),
        }
    }
}

/// Selects the attention kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionActivation {
    #[default]
    Softmax,
    #[serde(alias = "squared_relu")]
    Relu2,
}

impl FromStr for AttentionActivation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "softmax" => Ok(Self::Softmax),
            "relu2" | "squared_relu" => Ok(Self::Relu2),
            other => Err(ConfigError::UnknownAttentionActivation(other.to_string())),
        }
    }
}

impl Display for AttentionActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Softmax => write!(f, "softmax"),
            Self::Relu2 => write!(f, "relu2"),
        }
    }
}

serde_default_fn!(usize, ndim_default, 2);
serde_default_fn!(f32, dropout_default, 0.0);
serde_default_fn!(bool, bidirectional_default, false);
serde_default_fn!(usize, max_positions_default, 1024);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatedCrossAttentionConfig {
    pub embed_dim: usize,
    pub zdim: usize,
    #[serde(default = "ndim_default")]
    pub ndim: usize,
    #[serde(default = "dropout_default")]
    pub attention_dropout: f32,
    #[serde(default = "dropout_default")]
    pub hidden_dropout: f32,
    #[serde(default)]
    pub activation: GateActivation,
    #[serde(default)]
    pub attention_activation: AttentionActivation,
    #[serde(default = "bidirectional_default")]
    pub bidirectional: bool,
    #[serde(default)]
    pub truncation: Option<usize>,
    #[serde(default = "max_positions_default")]
    pub max_positions: usize,
}

impl GatedCrossAttentionConfig {
    pub fn new(embed_dim: usize, zdim: usize) -> Self {
        Self {
            embed_dim,
            zdim,
            ndim: ndim_default(),
            attention_dropout: dropout_default(),
            hidden_dropout: dropout_default(),
            activation: GateActivation::default(),
            attention_activation: AttentionActivation::default(),
            bidirectional: bidirectional_default(),
            truncation: None,
            max_positions: max_positions_default(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("embed_dim", self.embed_dim),
            ("zdim", self.zdim),
            ("ndim", self.ndim),
            ("max_positions", self.max_positions),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        if let Some(0) = self.truncation {
            return Err(ConfigError::NotPositive {
                name: "truncation",
                value: 0,
            });
        }
        if self.zdim > self.embed_dim {
            return Err(ConfigError::ZdimTooLarge {
                zdim: self.zdim,
                embed_dim: self.embed_dim,
            });
        }
        for (name, value) in [
            ("attention_dropout", self.attention_dropout),
            ("hidden_dropout", self.hidden_dropout),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        Ok(())
    }
}
