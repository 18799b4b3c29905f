//! Multi-head scaled dot-product attention, masks and positional encodings.
//!
//! Masks are additive: 0 where attention is allowed and [`MASK_VALUE`] where
//! it is not. They broadcast against scores of shape (batch, heads, q, k).

use candle_core::{bail, Device, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::norm::softmax_last_dim;

/// Additive score for disallowed attention pairs.
pub const MASK_VALUE: f32 = -1e9;

/// Multi-head attention with separate query and key/value inputs.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    /// Create an attention block over `embed_dim` split into `num_heads`.
    pub fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            bail!("embed_dim {embed_dim} is not divisible by {num_heads} heads");
        }
        Ok(Self {
            q_proj: candle_nn::linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear(embed_dim, embed_dim, vb.pp("o_proj"))?,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// Number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Attend from `query` (B, Nq, D) to `key_value` (B, Nk, D).
    pub fn forward(&self, query: &Tensor, key_value: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        Ok(self.forward_with_weights(query, key_value, bias)?.0)
    }

    /// Like [`forward`](Self::forward), also returning weights (B, H, Nq, Nk).
    pub fn forward_with_weights(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, q_len, _) = query.dims3()?;
        let k_len = key_value.dim(1)?;

        let q = self.split_heads(&self.q_proj.forward(query)?, batch, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(key_value)?, batch, k_len)?;
        let v = self.split_heads(&self.v_proj.forward(key_value)?, batch, k_len)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let scores = match bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };
        let weights = softmax_last_dim(&scores)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        Ok((self.o_proj.forward(&out)?, weights))
    }

    /// (B, N, D) -> (B, H, N, D / H)
    fn split_heads(&self, x: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        x.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Lower-triangular mask (1, 1, len, len) for autoregressive decoding.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j <= i { 0.0 } else { MASK_VALUE }))
        .collect();
    Tensor::from_vec(mask, (1, 1, len, len), device)
}

/// Band mask (1, 1, len, len) allowing |i - j| <= radius.
pub fn neighbor_mask(len: usize, radius: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| {
            (0..len).map(move |j| if i.abs_diff(j) <= radius { 0.0 } else { MASK_VALUE })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, len, len), device)
}

/// Turn a (B, N) validity mask of ones and zeros into an additive (B, 1, 1, N) bias.
pub fn key_padding_bias(key_mask: &Tensor) -> Result<Tensor> {
    let (batch, len) = key_mask.dims2()?;
    key_mask
        .affine(-(MASK_VALUE as f64), MASK_VALUE as f64)?
        .reshape((batch, 1, 1, len))
}

/// Fixed sinusoidal encodings of position or of ln(scale).
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    inv_freq: Tensor,
    max_len: usize,
}

impl PositionalEncoding {
    /// Precompute encodings for `max_len` positions of width `dim` (even).
    pub fn new(dim: usize, max_len: usize, device: &Device) -> Result<Self> {
        if dim % 2 != 0 {
            bail!("positional encoding width must be even, got {dim}");
        }
        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / 10000f32.powf((2 * i) as f32 / dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, dim / 2), device)?;

        let positions: Vec<f32> = (0..max_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_len, 1), device)?;
        let angles = positions.matmul(&inv_freq)?;
        let table = Tensor::cat(&[&angles.sin()?, &angles.cos()?], D::Minus1)?;

        Ok(Self {
            table,
            inv_freq,
            max_len,
        })
    }

    /// Encodings (1, len, dim) of positions 0..len.
    pub fn by_index(&self, len: usize) -> Result<Tensor> {
        if len > self.max_len {
            bail!("sequence of {len} exceeds positional table of {}", self.max_len);
        }
        self.table.narrow(0, 0, len)?.unsqueeze(0)
    }

    /// Encodings (B, N, dim) of ln(k) read from node features (B, N, 4).
    pub fn by_scale(&self, nodes: &Tensor) -> Result<Tensor> {
        let log_scale = nodes.narrow(D::Minus1, 3, 1)?.clamp(1e-12f32, f32::MAX)?.log()?;
        let angles = log_scale.broadcast_mul(&self.inv_freq.unsqueeze(0)?)?;
        Tensor::cat(&[&angles.sin()?, &angles.cos()?], D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn test_causal_mask_pattern() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        let values: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], MASK_VALUE);
        assert_eq!(values[4], 0.0);
        assert_eq!(values[8], 0.0);
    }

    #[test]
    fn test_neighbor_mask_band() {
        let mask = neighbor_mask(4, 1, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, MASK_VALUE, MASK_VALUE]);
        assert_eq!(rows[2], vec![MASK_VALUE, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_key_padding_bias() {
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0]], &Device::Cpu).unwrap();
        let bias = key_padding_bias(&mask).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 1, 3]);
        let values: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![0.0, 0.0, MASK_VALUE]);
    }

    #[test]
    fn test_attention_shapes_and_masking() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiHeadAttention::new(16, 4, vb).unwrap();
        assert_eq!(attn.num_heads(), 4);

        let q = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device).unwrap();
        let kv = Tensor::randn(0.0f32, 1.0, (2, 5, 16), &device).unwrap();
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0]], &device)
            .unwrap();
        let bias = key_padding_bias(&mask).unwrap();
        let (out, weights) = attn.forward_with_weights(&q, &kv, Some(&bias)).unwrap();
        assert_eq!(out.dims(), &[2, 3, 16]);
        assert_eq!(weights.dims(), &[2, 4, 3, 5]);

        let masked = weights
            .narrow(0, 0, 1)
            .unwrap()
            .narrow(3, 2, 3)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(masked.abs() < 1e-6, "padded keys must get no weight");
    }

    #[test]
    fn test_indivisible_heads() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(MultiHeadAttention::new(10, 4, vb).is_err());
    }

    #[test]
    fn test_positional_encoding() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 16, &device).unwrap();
        let table = pe.by_index(4).unwrap();
        assert_eq!(table.dims(), &[1, 4, 8]);
        // position 0: sin = 0, cos = 1
        let first: Vec<f32> = table.i((0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(&first[..4], &[0.0; 4]);
        assert_eq!(&first[4..], &[1.0; 4]);
        assert!(pe.by_index(17).is_err());

        let nodes = Tensor::new(&[[[1.0f32, 1.0, 1.0, 1.0], [1.0, 1.0, 1.0, 0.5]]], &device).unwrap();
        let by_scale = pe.by_scale(&nodes).unwrap();
        assert_eq!(by_scale.dims(), &[1, 2, 8]);
        // ln(1) = 0 encodes like position 0
        let at_unit: Vec<f32> = by_scale.i((0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(at_unit, first);
    }
}
