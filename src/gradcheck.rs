//! Finite-difference cross-check of autodiff gradients.
//!
//! Training always uses candle's exact gradients. This module exists to
//! validate them: it perturbs individual parameter entries and compares the
//! central difference of the combined loss with the backward pass.

use candle_core::{Tensor, Var};

use crate::data::SurrogateBatch;
use crate::error::{SurrogateError, SurrogateResult};
use crate::loss::CombinedLoss;
use crate::model::SurrogateModel;

/// Comparison for one parameter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheck {
    /// Parameter name
    pub parameter: String,
    /// Flat index within the parameter
    pub index: usize,
    /// Autodiff gradient
    pub analytic: f64,
    /// Central-difference estimate
    pub numeric: f64,
}

impl GradientCheck {
    /// |a − n| / max(|a| + |n|, floor)
    pub fn relative_error(&self, floor: f64) -> f64 {
        (self.analytic - self.numeric).abs() / (self.analytic.abs() + self.numeric.abs()).max(floor)
    }
}

/// Compare autodiff and central differences on `entries` evenly spaced
/// entries of every parameter whose name contains `filter`.
///
/// Parameters are restored to their original values on return.
pub fn check_gradients(
    model: &SurrogateModel,
    loss: &CombinedLoss,
    batch: &SurrogateBatch,
    filter: &str,
    entries: usize,
    epsilon: f64,
) -> SurrogateResult<Vec<GradientCheck>> {
    if !(epsilon > 0.0) {
        return Err(SurrogateError::configuration("epsilon must be positive"));
    }
    let output = model.forward(batch)?;
    let grads = loss.compute(&output, &batch.targets)?.total.backward()?;

    let mut checks = Vec::new();
    for (name, var) in model.parameters()? {
        if !name.contains(filter) {
            continue;
        }
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let analytic: Vec<f32> = grad.flatten_all()?.to_vec1()?;
        let len = analytic.len();
        let count = entries.min(len);
        for k in 0..count {
            let index = k * len / count;
            let numeric = central_difference(model, loss, batch, &var, index, epsilon)?;
            checks.push(GradientCheck {
                parameter: name.clone(),
                index,
                analytic: analytic[index] as f64,
                numeric,
            });
        }
    }
    tracing::debug!(checked = checks.len(), "gradient check");
    Ok(checks)
}

fn central_difference(
    model: &SurrogateModel,
    loss: &CombinedLoss,
    batch: &SurrogateBatch,
    var: &Var,
    index: usize,
    epsilon: f64,
) -> SurrogateResult<f64> {
    let original = var.as_tensor().copy()?;
    let values: Vec<f32> = original.flatten_all()?.to_vec1()?;

    let evaluate = |delta: f64| -> SurrogateResult<f64> {
        let mut shifted = values.clone();
        shifted[index] += delta as f32;
        var.set(&Tensor::from_vec(shifted, var.dims(), var.device())?)?;
        let output = model.forward(batch)?;
        Ok(loss.compute(&output, &batch.targets)?.breakdown.total)
    };
    let result = evaluate(epsilon).and_then(|plus| Ok((plus - evaluate(-epsilon)?) / (2.0 * epsilon)));
    var.set(&original)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurrogateConfig;
    use crate::data::{CouplingBounds, TrajectoryDataset};
    use crate::engine::LinearFlow;
    use crate::loss::LossWeights;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_heads_match_finite_differences() {
        let config = SurrogateConfig::test();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let model = SurrogateModel::new(&config, &Device::Cpu, &mut rng).unwrap();
        let loss = CombinedLoss::new(LossWeights::default()).unwrap();

        let flow = LinearFlow::new([0.7, 0.9, 1.1], [0.2, 0.4, 0.6]);
        let data = TrajectoryDataset::generate(&flow, 1, 4, CouplingBounds::uniform(0.5, 1.5), 6).unwrap();
        let examples: Vec<_> = data.examples().iter().collect();
        let batch = SurrogateBatch::collate(&examples, &config, &Device::Cpu).unwrap();

        let before: Vec<f32> = model.parameters().unwrap()[0].1.flatten_all().unwrap().to_vec1().unwrap();
        let checks = check_gradients(&model, &loss, &batch, "head", 2, 1e-3).unwrap();
        assert!(!checks.is_empty());
        for check in &checks {
            assert!(
                (check.analytic - check.numeric).abs() < 2e-3 || check.relative_error(1e-3) < 5e-2,
                "{} [{}]: analytic {} numeric {}",
                check.parameter,
                check.index,
                check.analytic,
                check.numeric
            );
        }
        let after: Vec<f32> = model.parameters().unwrap()[0].1.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after);
    }
}
