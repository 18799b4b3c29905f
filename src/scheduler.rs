//! Per-epoch learning rate schedules.

use serde::{Deserialize, Serialize};

use crate::error::{SurrogateError, SurrogateResult};

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerType {
    /// Fixed learning rate
    Constant {
        /// Learning rate
        lr: f64,
    },
    /// `lr0 * rate^epoch`
    ExponentialDecay {
        /// Initial learning rate
        lr0: f64,
        /// Decay per epoch
        rate: f64,
    },
    /// Multiply by `factor` at every reached milestone
    StepDecay {
        /// Initial learning rate
        lr0: f64,
        /// Epochs at which the rate drops
        milestones: Vec<usize>,
        /// Multiplier applied per milestone
        factor: f64,
    },
    /// Half-cosine from `lr0` down to `lr_min` over `total_epochs`
    CosineAnnealing {
        /// Initial learning rate
        lr0: f64,
        /// Floor reached at `total_epochs`
        lr_min: f64,
        /// Length of the annealing period
        total_epochs: usize,
    },
}

impl Default for SchedulerType {
    fn default() -> Self {
        Self::Constant { lr: 1e-3 }
    }
}

impl SchedulerType {
    /// Learning rate at `epoch` (0-based).
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::ExponentialDecay { lr0, rate } => lr0 * rate.powi(epoch as i32),
            Self::StepDecay {
                lr0,
                milestones,
                factor,
            } => {
                let reached = milestones.iter().filter(|&&m| epoch >= m).count();
                lr0 * factor.powi(reached as i32)
            }
            Self::CosineAnnealing {
                lr0,
                lr_min,
                total_epochs,
            } => {
                let progress = epoch.min(*total_epochs) as f64 / *total_epochs as f64;
                lr_min + (lr0 - lr_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
            }
        }
    }

    /// Reject non-positive rates and empty periods.
    pub fn validate(&self) -> SurrogateResult<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(SurrogateError::configuration(format!(
                    "{name} must be positive and finite, got {v}"
                )))
            }
        };
        match self {
            Self::Constant { lr } => positive("lr", *lr),
            Self::ExponentialDecay { lr0, rate } => {
                positive("lr0", *lr0)?;
                positive("rate", *rate)
            }
            Self::StepDecay { lr0, factor, .. } => {
                positive("lr0", *lr0)?;
                positive("factor", *factor)
            }
            Self::CosineAnnealing {
                lr0,
                lr_min,
                total_epochs,
            } => {
                positive("lr0", *lr0)?;
                if !(*lr_min >= 0.0 && lr_min <= lr0) {
                    return Err(SurrogateError::configuration(format!(
                        "lr_min must lie in [0, lr0], got {lr_min}"
                    )));
                }
                if *total_epochs == 0 {
                    return Err(SurrogateError::configuration("total_epochs must be positive"));
                }
                Ok(())
            }
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LRScheduler {
    scheduler_type: SchedulerType,
    current_epoch: usize,
}

impl LRScheduler {
    /// Create a new scheduler at epoch 0.
    pub fn new(scheduler_type: SchedulerType) -> SurrogateResult<Self> {
        scheduler_type.validate()?;
        Ok(Self {
            scheduler_type,
            current_epoch: 0,
        })
    }

    /// Get learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        self.scheduler_type.lr_at(self.current_epoch)
    }

    /// Advance one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.current_epoch += 1;
        self.get_lr()
    }

    /// Epochs stepped so far.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Schedule in use.
    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }
}
