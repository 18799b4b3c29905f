//! Learned surrogate for renormalization-group coupling trajectories
//!
//! This crate trains an encoder-decoder transformer to replace numerical RG
//! integration, providing:
//! - Graph-attention encoding of trajectories (coupling-state nodes, beta edges)
//! - A decoder with coupling, fixed-point and action heads
//! - Single-step, autoregressive and batched prediction
//! - A multi-task loss built from a registry of loss terms
//! - An epoch trainer with LR schedules, early stopping and safetensors checkpoints
//! - Held-out metrics and a speedup benchmark against the ground-truth integrator
//!
//! # Example
//!
//! ```no_run
//! use candle_core::Device;
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use rg_surrogate_rs::prelude::*;
//!
//! # fn main() -> SurrogateResult<()> {
//! let flow = LinearFlow::new([0.8, 1.0, 1.2], [0.3, 0.5, 0.7]);
//! let data = TrajectoryDataset::generate(&flow, 42, 200, CouplingBounds::uniform(0.1, 2.0), 20)?;
//! let (train, val) = data.split(0.8, 7)?;
//!
//! let mut rng = ChaCha8Rng::seed_from_u64(0);
//! let model = SurrogateModel::new(&SurrogateConfig::small(), &Device::Cpu, &mut rng)?;
//! let loss = CombinedLoss::new(LossWeights::default())?;
//! let mut trainer = Trainer::new(model, loss, TrainerConfig::default())?;
//! trainer.train(&train, &val)?;
//!
//! let report = Evaluator::new(EvaluatorConfig::default())?.evaluate(trainer.model(), &val)?;
//! println!("{:?}", report.to_flat_map());
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decoder;
pub mod early_stopping;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod gradcheck;
pub mod history;
pub mod loss;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod scheduler;
pub mod state;
pub mod trainer;

pub use checkpoint::{load_model, CheckpointHeader, CheckpointManager, CHECKPOINT_SCHEMA_VERSION};
pub use config::{AttentionScope, ExperimentConfig, PositionalMode, SurrogateConfig};
pub use data::{CouplingBounds, DatasetConfig, DatasetReport, SurrogateBatch, TrainingExample, TrajectoryDataset};
pub use decoder::{DecoderOutput, ResonanceDecoder};
pub use early_stopping::EarlyStopping;
pub use encoder::GraphEncoder;
pub use engine::{GroundTruth, Integration, LinearFlow, PerturbativeBetas, ResonanceEngine};
pub use error::{ConvergenceFailure, SurrogateError, SurrogateResult};
pub use evaluate::{
    Clock, EvaluationReport, Evaluator, EvaluatorConfig, ManualClock, MonotonicClock, SpeedupBenchmark,
    SpeedupReport, SurrogatePredictor,
};
pub use history::{EpochRecord, TrainingHistory};
pub use loss::{CombinedLoss, LossRegistry, LossTerm, LossWeights};
pub use model::{Prediction, SurrogateModel};
pub use optimizer::{GradientDescent, OptimizerConfig, UpdateRule};
pub use scheduler::{LRScheduler, SchedulerType};
pub use state::{CouplingState, HolographicState};
pub use trainer::{EarlyStoppingConfig, Trainer, TrainerConfig, TrainerState};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SurrogateConfig;
    pub use crate::data::{CouplingBounds, TrajectoryDataset};
    pub use crate::engine::{GroundTruth, LinearFlow};
    pub use crate::error::{SurrogateError, SurrogateResult};
    pub use crate::evaluate::{Evaluator, EvaluatorConfig, SpeedupBenchmark};
    pub use crate::loss::{CombinedLoss, LossWeights};
    pub use crate::model::SurrogateModel;
    pub use crate::state::{CouplingState, HolographicState};
    pub use crate::trainer::{Trainer, TrainerConfig, TrainerState};
}
