//! Gradient-descent update rules over the model's parameter store.
//!
//! Gradients come from candle's reverse-mode autodiff. Before any parameter is
//! touched the global gradient norm is checked; a non-finite value aborts the
//! step with the parameters unchanged.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{SurrogateError, SurrogateResult};

/// How parameters move along the gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRule {
    /// w -= lr * g
    Sgd,
    /// v = momentum * v + g; w -= lr * v
    Momentum { momentum: f64 },
    /// Bias-corrected adaptive moments
    Adam { beta1: f64, beta2: f64, eps: f64 },
}

impl UpdateRule {
    /// Adam with the usual constants.
    pub const fn adam() -> Self {
        Self::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Update rule
    pub rule: UpdateRule,
    /// Decoupled weight decay coefficient
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rule: UpdateRule::Momentum { momentum: 0.9 },
            weight_decay: 0.0,
            max_grad_norm: Some(10.0),
        }
    }
}

impl OptimizerConfig {
    /// Check hyperparameter ranges.
    pub fn validate(&self) -> SurrogateResult<()> {
        let in_unit = |v: f64| (0.0..1.0).contains(&v);
        match self.rule {
            UpdateRule::Sgd => {}
            UpdateRule::Momentum { momentum } if !in_unit(momentum) => {
                return Err(SurrogateError::configuration(format!(
                    "momentum must lie in [0, 1), got {momentum}"
                )));
            }
            UpdateRule::Adam { beta1, beta2, eps } if !in_unit(beta1) || !in_unit(beta2) || !(eps > 0.0) => {
                return Err(SurrogateError::configuration(format!(
                    "invalid Adam parameters beta1={beta1} beta2={beta2} eps={eps}"
                )));
            }
            _ => {}
        }
        if !(self.weight_decay >= 0.0) {
            return Err(SurrogateError::configuration("weight_decay must be non-negative"));
        }
        if let Some(clip) = self.max_grad_norm {
            if !(clip > 0.0) {
                return Err(SurrogateError::configuration("max_grad_norm must be positive"));
            }
        }
        Ok(())
    }
}

/// Serializable optimizer state stored in checkpoint headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Settings in effect
    pub config: OptimizerConfig,
    /// Number of applied steps
    pub step: usize,
}

/// Statistics of an applied step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    /// Whether clipping rescaled the gradient
    pub clipped: bool,
}

/// Result of [`GradientDescent::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Parameters were updated
    Applied(StepStats),
    /// A gradient was not finite; nothing was updated
    NonFinite {
        /// First offending parameter
        parameter: String,
    },
}

/// Gradient-descent optimizer with optional momentum or Adam buffers.
#[derive(Debug)]
pub struct GradientDescent {
    config: OptimizerConfig,
    first: BTreeMap<String, Var>,
    second: BTreeMap<String, Var>,
    step: usize,
}

impl GradientDescent {
    /// Create an optimizer with empty buffers.
    pub fn new(config: OptimizerConfig) -> SurrogateResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            first: BTreeMap::new(),
            second: BTreeMap::new(),
            step: 0,
        })
    }

    /// Settings in effect.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Applied step count.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Apply one update at learning rate `lr`.
    pub fn step(&mut self, params: &[(String, Var)], grads: &GradStore, lr: f64) -> SurrogateResult<StepOutcome> {
        let mut active: Vec<(&String, &Var, &Tensor)> = Vec::with_capacity(params.len());
        let mut norm_sq = 0.0f64;
        for (name, var) in params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq = grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                if !sq.is_finite() {
                    return Ok(StepOutcome::NonFinite {
                        parameter: name.clone(),
                    });
                }
                norm_sq += sq;
                active.push((name, var, grad));
            }
        }
        let grad_norm = norm_sq.sqrt();
        if !grad_norm.is_finite() {
            let parameter = active.first().map(|a| a.0.clone()).unwrap_or_default();
            return Ok(StepOutcome::NonFinite { parameter });
        }

        let clip_scale = match self.config.max_grad_norm {
            Some(max) if grad_norm > max => Some(max / grad_norm),
            _ => None,
        };

        self.step += 1;
        for (name, var, grad) in active {
            let grad = match clip_scale {
                Some(scale) => (grad * scale)?,
                None => grad.clone(),
            };
            let direction = self.direction(name, var, &grad)?;
            let mut next = (var.as_tensor() - (direction * lr)?)?;
            if self.config.weight_decay > 0.0 {
                next = (&next - (var.as_tensor() * (lr * self.config.weight_decay))?)?;
            }
            var.set(&next)?;
        }

        Ok(StepOutcome::Applied(StepStats {
            grad_norm,
            clipped: clip_scale.is_some(),
        }))
    }

    /// Update direction for one parameter, advancing its buffers.
    fn direction(&mut self, name: &str, var: &Var, grad: &Tensor) -> SurrogateResult<Tensor> {
        match self.config.rule {
            UpdateRule::Sgd => Ok(grad.clone()),
            UpdateRule::Momentum { momentum } => {
                let velocity = buffer(&mut self.first, name, var)?;
                let next = ((velocity.as_tensor() * momentum)? + grad)?;
                velocity.set(&next)?;
                Ok(next)
            }
            UpdateRule::Adam { beta1, beta2, eps } => {
                let t = self.step as i32;
                let m = buffer(&mut self.first, name, var)?;
                let next_m = ((m.as_tensor() * beta1)? + (grad * (1.0 - beta1))?)?;
                m.set(&next_m)?;

                let v = buffer(&mut self.second, name, var)?;
                let next_v = ((v.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
                v.set(&next_v)?;

                let m_hat = (next_m / (1.0 - beta1.powi(t)))?;
                let v_hat = (next_v / (1.0 - beta2.powi(t)))?;
                Ok((m_hat / (v_hat.sqrt()? + eps)?)?)
            }
        }
    }

    /// Serializable state without buffers.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            config: self.config,
            step: self.step,
        }
    }

    /// Buffers as named tensors, e.g. `first.<param>` and `second.<param>`.
    pub fn buffers(&self) -> Vec<(String, Tensor)> {
        self.first
            .iter()
            .map(|(name, var)| (format!("first.{name}"), var.as_tensor().clone()))
            .chain(
                self.second
                    .iter()
                    .map(|(name, var)| (format!("second.{name}"), var.as_tensor().clone())),
            )
            .collect()
    }

    /// Restore state and buffers written by [`state`](Self::state) and
    /// [`buffers`](Self::buffers).
    pub fn restore(&mut self, state: &OptimizerState, buffers: HashMap<String, Tensor>) -> SurrogateResult<()> {
        state.config.validate()?;
        let mut first = BTreeMap::new();
        let mut second = BTreeMap::new();
        for (key, tensor) in buffers {
            let var = Var::from_tensor(&tensor)?;
            if let Some(name) = key.strip_prefix("first.") {
                first.insert(name.to_string(), var);
            } else if let Some(name) = key.strip_prefix("second.") {
                second.insert(name.to_string(), var);
            } else {
                return Err(SurrogateError::checkpoint_mismatch(
                    "optimizer buffer",
                    "first.* or second.*",
                    key,
                ));
            }
        }
        self.config = state.config;
        self.step = state.step;
        self.first = first;
        self.second = second;
        Ok(())
    }
}

fn buffer<'a>(store: &'a mut BTreeMap<String, Var>, name: &str, like: &Var) -> SurrogateResult<&'a Var> {
    if !store.contains_key(name) {
        let zeros = Var::zeros(like.dims(), like.dtype(), like.device())?;
        store.insert(name.to_string(), zeros);
    }
    store
        .get(name)
        .ok_or_else(|| SurrogateError::training(format!("missing optimizer buffer {name}")))
}
