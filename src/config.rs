//! Configuration for the surrogate architecture and experiments.
//!
//! Every value that influences parameter shapes lives in [`SurrogateConfig`]
//! and is written into checkpoint headers, so a reload can reject weights
//! produced by a different architecture.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::DatasetConfig;
use crate::error::{SurrogateError, SurrogateResult};
use crate::evaluate::EvaluatorConfig;
use crate::trainer::TrainerConfig;

/// How positions are encoded before the encoder layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionalMode {
    /// Sinusoids of the node index
    Index,
    /// Sinusoids of ln(scale)
    Scale,
}

/// Which nodes a graph-attention layer may attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionScope {
    /// Every node attends to every node
    Dense,
    /// Nodes attend to neighbors within `radius` positions
    Neighbors { radius: usize },
}

/// Architecture and task configuration for the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateConfig {
    /// Node embedding dimension D
    pub embed_dim: usize,
    /// Edge embedding dimension
    pub edge_dim: usize,
    /// Number of graph-attention layers
    pub num_encoder_layers: usize,
    /// Attention heads per encoder layer
    pub num_encoder_heads: usize,
    /// Number of decoder layers
    pub num_decoder_layers: usize,
    /// Attention heads per decoder layer
    pub num_decoder_heads: usize,
    /// Hidden width of the decoder feed-forward block
    pub ff_dim: usize,
    /// Longest sequence the positional tables cover
    pub max_len: usize,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
    /// Positional encoding variant
    pub positional: PositionalMode,
    /// Encoder attention scope
    pub scope: AttentionScope,
    /// Modulate encoder attention scores with edge embeddings
    pub edge_bias: bool,
    /// Number of observed trajectory nodes given to the encoder
    pub context_len: usize,
    /// Number of decoder positions trained per example (1 = single-step)
    pub horizon: usize,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self::small()
    }
}

impl SurrogateConfig {
    /// Default working size.
    pub fn small() -> Self {
        Self {
            embed_dim: 64,
            edge_dim: 32,
            num_encoder_layers: 2,
            num_encoder_heads: 4,
            num_decoder_layers: 2,
            num_decoder_heads: 4,
            ff_dim: 128,
            max_len: 256,
            layer_norm_eps: 1e-5,
            positional: PositionalMode::Index,
            scope: AttentionScope::Dense,
            edge_bias: true,
            context_len: 8,
            horizon: 1,
        }
    }

    /// Larger encoder/decoder stack, closer to the original surrogate sizes.
    pub fn base() -> Self {
        Self {
            embed_dim: 128,
            edge_dim: 64,
            num_encoder_layers: 4,
            num_encoder_heads: 8,
            num_decoder_layers: 4,
            num_decoder_heads: 8,
            ff_dim: 512,
            max_len: 1024,
            ..Self::small()
        }
    }

    /// Tiny configuration for unit tests.
    pub fn test() -> Self {
        Self {
            embed_dim: 16,
            edge_dim: 8,
            num_encoder_layers: 1,
            num_encoder_heads: 2,
            num_decoder_layers: 1,
            num_decoder_heads: 2,
            ff_dim: 32,
            max_len: 64,
            layer_norm_eps: 1e-5,
            positional: PositionalMode::Index,
            scope: AttentionScope::Dense,
            edge_bias: true,
            context_len: 4,
            horizon: 1,
        }
    }

    /// Set the rollout horizon.
    #[must_use]
    pub const fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    /// Set the encoder context length.
    #[must_use]
    pub const fn with_context_len(mut self, context_len: usize) -> Self {
        self.context_len = context_len;
        self
    }

    /// Per-head dimension in the encoder.
    pub fn encoder_head_dim(&self) -> usize {
        self.embed_dim / self.num_encoder_heads
    }

    /// Per-head dimension in the decoder.
    pub fn decoder_head_dim(&self) -> usize {
        self.embed_dim / self.num_decoder_heads
    }

    /// Check dimensional consistency.
    pub fn validate(&self) -> SurrogateResult<()> {
        if self.embed_dim == 0 || self.embed_dim % 2 != 0 {
            return Err(SurrogateError::configuration(format!(
                "embed_dim must be even and positive, got {}",
                self.embed_dim
            )));
        }
        if self.edge_dim == 0 || self.ff_dim == 0 {
            return Err(SurrogateError::configuration(
                "edge_dim and ff_dim must be positive",
            ));
        }
        for (name, heads) in [
            ("num_encoder_heads", self.num_encoder_heads),
            ("num_decoder_heads", self.num_decoder_heads),
        ] {
            if heads == 0 || self.embed_dim % heads != 0 {
                return Err(SurrogateError::configuration(format!(
                    "embed_dim {} is not divisible by {name} {heads}",
                    self.embed_dim
                )));
            }
        }
        if self.num_encoder_layers == 0 || self.num_decoder_layers == 0 {
            return Err(SurrogateError::configuration(
                "encoder and decoder need at least one layer",
            ));
        }
        if self.context_len == 0 || self.horizon == 0 {
            return Err(SurrogateError::configuration(
                "context_len and horizon must be positive",
            ));
        }
        if self.max_len < self.context_len || self.max_len < self.horizon {
            return Err(SurrogateError::configuration(format!(
                "max_len {} is shorter than context_len {} or horizon {}",
                self.max_len, self.context_len, self.horizon
            )));
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(SurrogateError::configuration("layer_norm_eps must be positive"));
        }
        Ok(())
    }

    /// First field that differs from `other`, as (field, ours, theirs).
    pub fn first_difference(&self, other: &Self) -> Option<(String, String, String)> {
        let ours = serde_json::to_value(self).ok()?;
        let theirs = serde_json::to_value(other).ok()?;
        let (ours, theirs) = (ours.as_object()?, theirs.as_object()?);
        ours.iter().find_map(|(key, value)| {
            let other_value = theirs.get(key).cloned().unwrap_or(serde_json::Value::Null);
            (value != &other_value).then(|| (key.clone(), value.to_string(), other_value.to_string()))
        })
    }
}

/// Everything needed to reproduce one experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Model architecture
    pub model: SurrogateConfig,
    /// Dataset generation
    pub dataset: DatasetConfig,
    /// Training loop
    pub trainer: TrainerConfig,
    /// Evaluation
    pub evaluator: EvaluatorConfig,
}

impl ExperimentConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> SurrogateResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file.
    pub fn to_file(&self, path: impl AsRef<Path>) -> SurrogateResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate all sections.
    pub fn validate(&self) -> SurrogateResult<()> {
        self.model.validate()?;
        self.dataset.validate()?;
        self.trainer.validate()?;
        self.evaluator.validate()
    }
}
