//! Transformer decoder with coupling, fixed-point and action heads.
//!
//! Decoder tokens are (λ, γ, μ, k_target): the couplings to advance from and
//! the scale to advance to. The coupling head predicts a correction to the
//! token couplings, so an untrained decoder starts near the identity map.

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::attention::{causal_mask, MultiHeadAttention, PositionalEncoding};
use crate::config::SurrogateConfig;
use crate::norm::{layer_norm, ManualLayerNorm};
use crate::state::NODE_FEATURES;

/// Position-wise two-layer ReLU block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    up: Linear,
    down: Linear,
}

impl FeedForward {
    /// Create a D -> F -> D block.
    pub fn new(embed_dim: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            up: candle_nn::linear(embed_dim, ff_dim, vb.pp("up"))?,
            down: candle_nn::linear(ff_dim, embed_dim, vb.pp("down"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.down.forward(&self.up.forward(x)?.relu()?)
    }
}

/// Self-attention, cross-attention and feed-forward, each post-normalized.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_norm: ManualLayerNorm,
    cross_attn: MultiHeadAttention,
    cross_attn_norm: ManualLayerNorm,
    ffn: FeedForward,
    ffn_norm: ManualLayerNorm,
}

impl DecoderLayer {
    /// Create a decoder layer.
    pub fn new(config: &SurrogateConfig, vb: VarBuilder) -> Result<Self> {
        let (d, heads, eps) = (config.embed_dim, config.num_decoder_heads, config.layer_norm_eps);
        Ok(Self {
            self_attn: MultiHeadAttention::new(d, heads, vb.pp("self_attn"))?,
            self_attn_norm: layer_norm(d, eps, vb.pp("self_attn_norm"))?,
            cross_attn: MultiHeadAttention::new(d, heads, vb.pp("cross_attn"))?,
            cross_attn_norm: layer_norm(d, eps, vb.pp("cross_attn_norm"))?,
            ffn: FeedForward::new(d, config.ff_dim, vb.pp("ffn"))?,
            ffn_norm: layer_norm(d, eps, vb.pp("ffn_norm"))?,
        })
    }

    /// Run one layer over tokens (B, T, D) against memory (B, N, D).
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        causal: &Tensor,
        memory_bias: &Tensor,
    ) -> Result<Tensor> {
        let x = self
            .self_attn_norm
            .forward(&(x + self.self_attn.forward(x, x, Some(causal))?)?)?;
        let x = self
            .cross_attn_norm
            .forward(&(&x + self.cross_attn.forward(&x, memory, Some(memory_bias))?)?)?;
        self.ffn_norm.forward(&(&x + self.ffn.forward(&x)?)?)
    }
}

/// Per-position outputs of the three heads.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Predicted couplings (B, T, 3)
    pub couplings: Tensor,
    /// Fixed-point logits (B, T, 1)
    pub fixed_point_logits: Tensor,
    /// Predicted action (B, T, 1)
    pub action: Tensor,
}

impl DecoderOutput {
    /// Number of decoded positions.
    pub fn horizon(&self) -> Result<usize> {
        self.couplings.dim(1)
    }

    fn last(t: &Tensor) -> Result<Tensor> {
        let len = t.dim(1)?;
        t.narrow(1, len - 1, 1)?.squeeze(1)
    }

    /// Couplings at the final position (B, 3).
    pub fn final_couplings(&self) -> Result<Tensor> {
        Self::last(&self.couplings)
    }

    /// Fixed-point logit at the final position (B, 1).
    pub fn final_fixed_point_logit(&self) -> Result<Tensor> {
        Self::last(&self.fixed_point_logits)
    }

    /// Action at the final position (B, 1).
    pub fn final_action(&self) -> Result<Tensor> {
        Self::last(&self.action)
    }
}

/// Decoder stack and output heads.
#[derive(Debug, Clone)]
pub struct ResonanceDecoder {
    token_embed: Linear,
    positional: PositionalEncoding,
    layers: Vec<DecoderLayer>,
    coupling_head: Linear,
    fixed_point_head: Linear,
    action_head: Linear,
}

impl ResonanceDecoder {
    /// Build the decoder from the architecture config.
    pub fn new(config: &SurrogateConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_decoder_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            token_embed: candle_nn::linear(NODE_FEATURES, config.embed_dim, vb.pp("token_embed"))?,
            positional: PositionalEncoding::new(config.embed_dim, config.max_len, vb.device())?,
            layers,
            coupling_head: candle_nn::linear(config.embed_dim, 3, vb.pp("coupling_head"))?,
            fixed_point_head: candle_nn::linear(config.embed_dim, 1, vb.pp("fixed_point_head"))?,
            action_head: candle_nn::linear(config.embed_dim, 1, vb.pp("action_head"))?,
        })
    }

    /// Decode tokens (B, T, 4) against encoded memory (B, N, D).
    ///
    /// Position t only sees tokens 0..=t, so teacher-forced training and
    /// step-by-step rollout produce the same value at each position.
    pub fn forward(&self, tokens: &Tensor, memory: &Tensor, memory_bias: &Tensor) -> Result<DecoderOutput> {
        let len = tokens.dim(1)?;
        let causal = causal_mask(len, tokens.device())?;

        let mut x = self
            .token_embed
            .forward(tokens)?
            .broadcast_add(&self.positional.by_index(len)?)?;
        for layer in &self.layers {
            x = layer.forward(&x, memory, &causal, memory_bias)?;
        }

        let current = tokens.narrow(D::Minus1, 0, 3)?;
        Ok(DecoderOutput {
            couplings: (current + self.coupling_head.forward(&x)?)?,
            fixed_point_logits: self.fixed_point_head.forward(&x)?,
            action: self.action_head.forward(&x)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn decoder(config: &SurrogateConfig) -> ResonanceDecoder {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ResonanceDecoder::new(config, vb).unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let config = SurrogateConfig::test();
        let dec = decoder(&config);
        let device = Device::Cpu;

        let tokens = Tensor::randn(0.0f32, 1.0, (2, 3, 4), &device).unwrap();
        let memory = Tensor::randn(0.0f32, 1.0, (2, 5, config.embed_dim), &device).unwrap();
        let bias = Tensor::zeros((2, 1, 1, 5), DType::F32, &device).unwrap();

        let out = dec.forward(&tokens, &memory, &bias).unwrap();
        assert_eq!(out.horizon().unwrap(), 3);
        assert_eq!(out.couplings.dims(), &[2, 3, 3]);
        assert_eq!(out.fixed_point_logits.dims(), &[2, 3, 1]);
        assert_eq!(out.action.dims(), &[2, 3, 1]);
        assert_eq!(out.final_couplings().unwrap().dims(), &[2, 3]);
        assert_eq!(out.final_action().unwrap().dims(), &[2, 1]);
    }

    #[test]
    fn test_causality() {
        let config = SurrogateConfig::test();
        let dec = decoder(&config);
        let device = Device::Cpu;

        let tokens = Tensor::randn(0.0f32, 1.0, (1, 4, 4), &device).unwrap();
        let memory = Tensor::randn(0.0f32, 1.0, (1, 3, config.embed_dim), &device).unwrap();
        let bias = Tensor::zeros((1, 1, 1, 3), DType::F32, &device).unwrap();

        let full = dec.forward(&tokens, &memory, &bias).unwrap();
        let prefix = dec
            .forward(&tokens.narrow(1, 0, 2).unwrap(), &memory, &bias)
            .unwrap();

        let a: Vec<f32> = full.couplings.narrow(1, 0, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = prefix.couplings.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "later tokens leaked into earlier positions");
        }
    }
}
