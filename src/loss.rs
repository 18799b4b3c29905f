//! Multi-task loss built from a registry of weighted terms.
//!
//! Each task contributes a [`LossTerm`]; [`CombinedLoss`] sums the registered
//! terms with weights fixed at construction. The default registry holds the
//! coupling MSE, fixed-point BCE, action MAE and trajectory-consistency terms.

use std::collections::BTreeMap;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::decoder::DecoderOutput;
use crate::error::{SurrogateError, SurrogateResult};

/// Probabilities are clipped to [BCE_EPS, 1 - BCE_EPS].
pub const BCE_EPS: f64 = 1e-7;

/// Supervision for the decoder heads.
#[derive(Debug, Clone)]
pub struct LossTargets {
    /// Coupling targets per decoder position (B, H, 3); the last is terminal
    pub couplings: Tensor,
    /// Fixed-point labels in {0, 1} (B, 1)
    pub fixed_point: Tensor,
    /// Action targets (B, 1)
    pub action: Tensor,
}

/// One task-specific loss component.
pub trait LossTerm: Send + Sync {
    /// Stable name used in breakdowns and logs.
    fn name(&self) -> &str;

    /// Scalar loss for a batch; must be differentiable w.r.t. the output.
    fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> Result<Tensor>;
}

/// Mean squared error of the terminal couplings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CouplingMse;

impl LossTerm for CouplingMse {
    fn name(&self) -> &str {
        "coupling"
    }

    fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> Result<Tensor> {
        let len = targets.couplings.dim(1)?;
        let target = targets.couplings.narrow(1, len - 1, 1)?.squeeze(1)?;
        (output.final_couplings()? - target)?.sqr()?.mean_all()
    }
}

/// Binary cross-entropy of the fixed-point head with clipped probabilities,
/// computed directly from the logit.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPointBce;

impl LossTerm for FixedPointBce {
    fn name(&self) -> &str {
        "fixed_point"
    }

    fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> Result<Tensor> {
        // clamping the logit to ±ln((1-eps)/eps) is the probability clip in logit space
        let bound = ((1.0 - BCE_EPS) / BCE_EPS).ln() as f32;
        let x = output.final_fixed_point_logit()?.clamp(-bound, bound)?;
        let y = &targets.fixed_point;
        // relu(x) - x*y + ln(1 + e^-|x|)
        let softplus = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
        ((x.relu()? - (&x * y)?)? + softplus)?.mean_all()
    }
}

/// Mean absolute error of the terminal action.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionMae;

impl LossTerm for ActionMae {
    fn name(&self) -> &str {
        "action"
    }

    fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> Result<Tensor> {
        (output.final_action()? - &targets.action)?.abs()?.mean_all()
    }
}

/// Cumulative squared divergence along the rollout, divided by the horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryConsistency;

impl LossTerm for TrajectoryConsistency {
    fn name(&self) -> &str {
        "trajectory"
    }

    fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> Result<Tensor> {
        let (batch, horizon, _) = targets.couplings.dims3()?;
        let per_step = (&output.couplings - &targets.couplings)?
            .sqr()?
            .mean_keepdim(2)?;
        per_step.sum_all()? / (batch * horizon) as f64
    }
}

/// Weights of the built-in terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    /// Coupling MSE weight
    pub coupling: f64,
    /// Fixed-point BCE weight
    pub fixed_point: f64,
    /// Action MAE weight
    pub action: f64,
    /// Trajectory-consistency weight
    pub trajectory: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            coupling: 1.0,
            fixed_point: 0.5,
            action: 0.1,
            trajectory: 0.0,
        }
    }
}

impl LossWeights {
    /// Defaults plus a trajectory term for multi-step rollout training.
    pub fn for_rollout() -> Self {
        Self {
            trajectory: 0.5,
            ..Self::default()
        }
    }
}

struct WeightedTerm {
    weight: f64,
    term: Box<dyn LossTerm>,
}

/// Ordered collection of weighted loss terms.
#[derive(Default)]
pub struct LossRegistry {
    terms: Vec<WeightedTerm>,
}

impl std::fmt::Debug for LossRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.terms.iter().map(|t| (t.term.name(), t.weight)))
            .finish()
    }
}

impl LossRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a term with its weight.
    #[must_use]
    pub fn with_term(mut self, weight: f64, term: impl LossTerm + 'static) -> Self {
        self.terms.push(WeightedTerm {
            weight,
            term: Box::new(term),
        });
        self
    }

    /// The four built-in terms with the given weights.
    pub fn standard(weights: LossWeights) -> Self {
        Self::new()
            .with_term(weights.coupling, CouplingMse)
            .with_term(weights.fixed_point, FixedPointBce)
            .with_term(weights.action, ActionMae)
            .with_term(weights.trajectory, TrajectoryConsistency)
    }

    /// Number of registered terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Whether no term is registered.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Per-term scalar values of one loss evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// Weighted total
    pub total: f64,
    /// Unweighted value of each term by name
    pub terms: BTreeMap<String, f64>,
}

impl LossBreakdown {
    /// Unweighted value of a named term.
    pub fn term(&self, name: &str) -> Option<f64> {
        self.terms.get(name).copied()
    }

    /// Whether the total and every term are finite.
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.terms.values().all(|v| v.is_finite())
    }

    /// Accumulate `other` scaled by `weight` (for batch-size weighted means).
    pub fn accumulate(&mut self, other: &Self, weight: f64) {
        self.total += other.total * weight;
        for (name, value) in &other.terms {
            *self.terms.entry(name.clone()).or_insert(0.0) += value * weight;
        }
    }

    /// Divide every value by `denominator`.
    pub fn scaled(mut self, denominator: f64) -> Self {
        self.total /= denominator;
        for value in self.terms.values_mut() {
            *value /= denominator;
        }
        self
    }
}

/// A differentiable total with its breakdown.
#[derive(Debug, Clone)]
pub struct LossValue {
    /// Scalar tensor to differentiate
    pub total: Tensor,
    /// Scalar values per term
    pub breakdown: LossBreakdown,
}

/// Weighted sum of registered loss terms.
#[derive(Debug)]
pub struct CombinedLoss {
    registry: LossRegistry,
    weights: Option<LossWeights>,
}

impl CombinedLoss {
    /// Standard terms with the given weights.
    pub fn new(weights: LossWeights) -> SurrogateResult<Self> {
        let mut loss = Self::from_registry(LossRegistry::standard(weights))?;
        loss.weights = Some(weights);
        Ok(loss)
    }

    /// Custom registry; weights must be finite and non-negative, not all zero.
    pub fn from_registry(registry: LossRegistry) -> SurrogateResult<Self> {
        if registry.is_empty() {
            return Err(SurrogateError::configuration("loss registry is empty"));
        }
        for entry in &registry.terms {
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(SurrogateError::configuration(format!(
                    "loss weight for '{}' must be finite and non-negative, got {}",
                    entry.term.name(),
                    entry.weight
                )));
            }
        }
        if registry.terms.iter().all(|t| t.weight == 0.0) {
            return Err(SurrogateError::configuration("all loss weights are zero"));
        }
        Ok(Self {
            registry,
            weights: None,
        })
    }

    /// Weights of the standard terms, if this loss was built from them.
    pub fn weights(&self) -> Option<LossWeights> {
        self.weights
    }

    /// Evaluate every term with non-zero weight.
    pub fn compute(&self, output: &DecoderOutput, targets: &LossTargets) -> SurrogateResult<LossValue> {
        let mut total: Option<Tensor> = None;
        let mut breakdown = LossBreakdown::default();
        for entry in &self.registry.terms {
            if entry.weight == 0.0 {
                continue;
            }
            let value = entry.term.compute(output, targets)?;
            let scalar = value.to_scalar::<f32>()? as f64;
            breakdown.terms.insert(entry.term.name().to_string(), scalar);

            let weighted = (value * entry.weight)?;
            total = Some(match total {
                Some(acc) => (acc + weighted)?,
                None => weighted,
            });
        }
        let total = total.ok_or_else(|| SurrogateError::configuration("no active loss term"))?;
        breakdown.total = total.to_scalar::<f32>()? as f64;
        Ok(LossValue { total, breakdown })
    }
}
