//! Error types for the RG surrogate.

use thiserror::Error;

/// Result type for surrogate operations.
pub type SurrogateResult<T> = Result<T, SurrogateError>;

/// Non-convergence reported by a ground-truth integrator for one sample.
///
/// Not fatal for dataset generation: the sample is excluded and counted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("integration did not converge at step {step}: {reason}")]
pub struct ConvergenceFailure {
    /// Integration step at which the failure was detected
    pub step: usize,
    /// Human readable cause
    pub reason: String,
}

impl ConvergenceFailure {
    /// Create a convergence failure at a given step.
    pub fn new(step: usize, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while building, training or evaluating the surrogate.
#[derive(Debug, Error)]
pub enum SurrogateError {
    /// Incompatible dimensions or weights at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Empty, malformed or insufficient dataset
    #[error("Data error: {0}")]
    Data(String),

    /// Non-finite loss or gradient during training
    #[error("Numerical instability at epoch {epoch}, batch {batch}: {detail}")]
    NumericalInstability {
        epoch: usize,
        batch: usize,
        detail: String,
    },

    /// Ground-truth generator failed to converge
    #[error("Convergence failure: {0}")]
    Convergence(#[from] ConvergenceFailure),

    /// Checkpoint metadata does not match the current model
    #[error("Checkpoint mismatch on {field}: expected {expected}, found {found}")]
    CheckpointMismatch {
        field: String,
        expected: String,
        found: String,
    },

    /// Training loop error
    #[error("Training error: {0}")]
    Training(String),

    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Safetensors container error
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

impl SurrogateError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a numerical instability error
    pub fn instability(epoch: usize, batch: usize, detail: impl Into<String>) -> Self {
        Self::NumericalInstability {
            epoch,
            batch,
            detail: detail.into(),
        }
    }

    /// Create a checkpoint mismatch error
    pub fn checkpoint_mismatch(
        field: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::CheckpointMismatch {
            field: field.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Whether training can continue past this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Convergence(_))
    }
}
