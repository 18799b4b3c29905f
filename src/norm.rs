//! Layer normalization and softmax built from primitive tensor ops.
//!
//! Both are composed of ops candle can differentiate, so gradients of the
//! combined loss flow through them exactly.

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

/// Layer normalization over the last dimension with learned gain and shift.
#[derive(Debug, Clone)]
pub struct ManualLayerNorm {
    gain: Tensor,
    shift: Tensor,
    eps: f64,
}

impl ManualLayerNorm {
    /// Create from existing gain and shift tensors.
    pub fn new(gain: Tensor, shift: Tensor, eps: f64) -> Self {
        Self { gain, shift, eps }
    }

    /// Width of the normalized dimension.
    pub fn width(&self) -> usize {
        self.gain.dims()[0]
    }
}

impl Module for ManualLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // y = (x - E[x]) / sqrt(Var[x] + eps) * gain + shift
        let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.gain)?
            .broadcast_add(&self.shift)
    }
}

/// Layer norm with gain initialized to one and shift to zero.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<ManualLayerNorm> {
    let gain = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    let shift = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
    Ok(ManualLayerNorm::new(gain, shift, eps))
}

/// Softmax over the last dimension, shifted by the row maximum.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let shifted = x.broadcast_sub(&x.max_keepdim(D::Minus1)?)?;
    let exp = shifted.exp()?;
    exp.broadcast_div(&exp.sum_keepdim(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_statistics() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = layer_norm(32, 1e-5, vb).unwrap();
        assert_eq!(norm.width(), 32);

        let x = Tensor::randn(3.0f32, 2.0, (2, 5, 32), &device).unwrap();
        let out = norm.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 32]);

        let mean = out.mean_keepdim(D::Minus1).unwrap().abs().unwrap();
        let max_mean = mean.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(max_mean < 1e-4, "row means should vanish, got {max_mean}");

        let var = out.sqr().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((var - 1.0).abs() < 1e-2, "variance should be one, got {var}");
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0], [-1e9, 0.0, -1e9]], &device).unwrap();
        let p = softmax_last_dim(&x).unwrap();
        let rows: Vec<Vec<f32>> = p.to_vec2().unwrap();
        for row in &rows {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
        assert_eq!(rows[1], vec![0.0, 1.0, 0.0]);
    }
}
