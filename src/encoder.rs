//! Graph-attention encoder over trajectory graphs.
//!
//! Nodes are coupling states and edges are beta vectors. Each node embedding
//! is combined with a fixed positional encoding, then refined by stacked
//! attention layers whose scores can be shifted per head by the embedding of
//! the edge arriving at the key node.
//!
//! There is no dropout or other stochastic op, so identical inputs and
//! weights give bit-identical outputs.

use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::attention::{key_padding_bias, neighbor_mask, MultiHeadAttention, PositionalEncoding};
use crate::config::{AttentionScope, PositionalMode, SurrogateConfig};
use crate::data::EncoderInput;
use crate::error::{SurrogateError, SurrogateResult};
use crate::norm::{layer_norm, ManualLayerNorm};
use crate::state::{HolographicState, EDGE_FEATURES, NODE_FEATURES};

/// One attention layer with residual connection and layer norm.
#[derive(Debug, Clone)]
pub struct GraphAttentionLayer {
    attention: MultiHeadAttention,
    edge_bias: Option<Linear>,
    norm: ManualLayerNorm,
}

impl GraphAttentionLayer {
    /// Create a layer; `edge_bias` adds the learned per-head edge term.
    pub fn new(config: &SurrogateConfig, vb: VarBuilder) -> Result<Self> {
        let attention =
            MultiHeadAttention::new(config.embed_dim, config.num_encoder_heads, vb.pp("attention"))?;
        let edge_bias = if config.edge_bias {
            Some(candle_nn::linear(
                config.edge_dim,
                config.num_encoder_heads,
                vb.pp("edge_bias"),
            )?)
        } else {
            None
        };
        let norm = layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            attention,
            edge_bias,
            norm,
        })
    }

    /// Update node embeddings (B, N, D), returning them with the attention weights.
    ///
    /// `mask` is an additive bias broadcastable to (B, H, N, N).
    pub fn forward(&self, x: &Tensor, edges: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let bias = match &self.edge_bias {
            Some(proj) => {
                // (B, N, H) -> (B, H, 1, N): a shift per key node and head
                let per_key = proj.forward(edges)?.transpose(1, 2)?.unsqueeze(2)?;
                mask.broadcast_add(&per_key)?
            }
            None => mask.clone(),
        };
        let (attended, weights) = self.attention.forward_with_weights(x, x, Some(&bias))?;
        Ok((self.norm.forward(&(x + attended)?)?, weights))
    }
}

/// Result of encoding a padded batch.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Encoded nodes (B, N, D)
    pub hidden: Tensor,
    /// Additive key bias for attending to `hidden` (B, 1, 1, N)
    pub key_bias: Tensor,
    /// Attention weights per layer, each (B, H, N, N)
    pub attention: Vec<Tensor>,
}

/// Embeds trajectory graphs into N×D matrices.
#[derive(Debug, Clone)]
pub struct GraphEncoder {
    node_embed: Linear,
    edge_embed: Linear,
    positional: PositionalEncoding,
    positional_mode: PositionalMode,
    max_len: usize,
    scope: AttentionScope,
    layers: Vec<GraphAttentionLayer>,
    output: Linear,
    device: Device,
}

impl GraphEncoder {
    /// Build the encoder from the architecture config.
    pub fn new(config: &SurrogateConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let layers = (0..config.num_encoder_layers)
            .map(|i| GraphAttentionLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            node_embed: candle_nn::linear(NODE_FEATURES, config.embed_dim, vb.pp("node_embed"))?,
            edge_embed: candle_nn::linear(EDGE_FEATURES, config.edge_dim, vb.pp("edge_embed"))?,
            positional: PositionalEncoding::new(config.embed_dim, config.max_len, device)?,
            positional_mode: config.positional,
            max_len: config.max_len,
            scope: config.scope,
            layers,
            output: candle_nn::linear(config.embed_dim, config.embed_dim, vb.pp("output"))?,
            device: device.clone(),
        })
    }

    /// Encode a padded batch.
    pub fn forward(&self, input: &EncoderInput) -> Result<EncoderOutput> {
        let len = input.nodes.dim(1)?;

        let nodes = self.node_embed.forward(&input.nodes)?.relu()?;
        let edges = self.edge_embed.forward(&input.edges)?.relu()?;
        let position = match self.positional_mode {
            PositionalMode::Index => self.positional.by_index(len)?,
            PositionalMode::Scale => self.positional.by_scale(&input.nodes)?,
        };
        let mut hidden = nodes.broadcast_add(&position)?;

        let key_bias = key_padding_bias(&input.key_mask)?;
        let mask = match self.scope {
            AttentionScope::Dense => key_bias.clone(),
            AttentionScope::Neighbors { radius } => {
                key_bias.broadcast_add(&neighbor_mask(len, radius, &self.device)?)?
            }
        };

        let mut attention = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, weights) = layer.forward(&hidden, &edges, &mask)?;
            hidden = next;
            attention.push(weights);
        }

        Ok(EncoderOutput {
            hidden: self.output.forward(&hidden)?,
            key_bias,
            attention,
        })
    }

    /// Encode a single trajectory into an (N, D) matrix.
    pub fn encode(&self, state: &HolographicState) -> SurrogateResult<Tensor> {
        let input = self.single_input(state)?;
        Ok(self.forward(&input)?.hidden.squeeze(0)?)
    }

    /// Per-layer attention maps (H, N, N) for one trajectory.
    pub fn attention_maps(&self, state: &HolographicState) -> SurrogateResult<Vec<Tensor>> {
        let input = self.single_input(state)?;
        let maps = self
            .forward(&input)?
            .attention
            .into_iter()
            .map(|w| w.squeeze(0))
            .collect::<Result<Vec<_>>>()?;
        Ok(maps)
    }

    fn single_input(&self, state: &HolographicState) -> SurrogateResult<EncoderInput> {
        if self.positional_mode == PositionalMode::Index && state.len() > self.max_len {
            return Err(SurrogateError::data(format!(
                "trajectory of {} nodes exceeds max_len {}",
                state.len(),
                self.max_len
            )));
        }
        EncoderInput::from_states(&[state], &self.device)
    }
}
