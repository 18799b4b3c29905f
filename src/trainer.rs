//! Epoch-based training loop.
//!
//! Each epoch iterates shuffled batches, differentiates the combined loss with
//! candle's autodiff, steps the optimizer at the scheduled learning rate, then
//! validates, records history, writes checkpoints and consults early stopping.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    load_checkpoint, read_header, CheckpointHeader, CheckpointManager, CHECKPOINT_SCHEMA_VERSION,
};
use crate::data::{SurrogateBatch, TrajectoryDataset};
use crate::early_stopping::EarlyStopping;
use crate::error::{SurrogateError, SurrogateResult};
use crate::history::{EpochRecord, TrainingHistory};
use crate::loss::{CombinedLoss, LossBreakdown};
use crate::model::SurrogateModel;
use crate::optimizer::{GradientDescent, OptimizerConfig, StepOutcome};
use crate::scheduler::{LRScheduler, SchedulerType};

/// File name of the history written next to the checkpoints.
pub const HISTORY_FILE: &str = "training_history.json";

/// Early stopping settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before stopping
    pub patience: usize,
    /// Minimum decrease that counts as improvement
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 10,
            min_delta: 0.0,
        }
    }
}

/// Training loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Maximum number of epochs
    pub epochs: usize,
    /// Examples per batch
    pub batch_size: usize,
    /// Base seed for per-epoch shuffling
    pub seed: u64,
    /// Shuffle training batches
    pub shuffle: bool,
    /// Learning rate schedule
    pub scheduler: SchedulerType,
    /// Update rule and clipping
    pub optimizer: OptimizerConfig,
    /// Early stopping, disabled when `None`
    pub early_stopping: Option<EarlyStoppingConfig>,
    /// Stop as converged once validation loss reaches this value
    pub target_loss: Option<f64>,
    /// Directory for checkpoints and history
    pub checkpoint_dir: Option<PathBuf>,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            seed: 42,
            shuffle: true,
            scheduler: SchedulerType::default(),
            optimizer: OptimizerConfig::default(),
            early_stopping: Some(EarlyStoppingConfig::default()),
            target_loss: None,
            checkpoint_dir: None,
            show_progress: false,
        }
    }
}

impl TrainerConfig {
    /// Validate configuration.
    pub fn validate(&self) -> SurrogateResult<()> {
        if self.epochs == 0 {
            return Err(SurrogateError::configuration("epochs must be positive"));
        }
        if self.batch_size == 0 {
            return Err(SurrogateError::configuration("batch_size must be positive"));
        }
        self.scheduler.validate()?;
        self.optimizer.validate()?;
        if let Some(es) = self.early_stopping {
            EarlyStopping::new(es.patience, es.min_delta)?;
        }
        if let Some(target) = self.target_loss {
            if !(target >= 0.0 && target.is_finite()) {
                return Err(SurrogateError::configuration(format!(
                    "target_loss must be finite and non-negative, got {target}"
                )));
            }
        }
        Ok(())
    }
}

/// Why training converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceReason {
    /// The configured epoch count was reached
    MaxEpochs,
    /// Validation loss reached the target
    TargetLoss,
}

/// Trainer lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainerState {
    /// Not started
    Idle,
    /// Inside the epoch loop
    Running { epoch: usize },
    /// Finished normally
    Converged { epoch: usize, reason: ConvergenceReason },
    /// Early stopping fired
    Stopped { epoch: usize },
    /// A non-finite value aborted training
    Failed { epoch: usize, detail: String },
}

impl TrainerState {
    /// Whether the loop has ended.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running { .. })
    }
}

/// Drives a [`SurrogateModel`] through training.
#[derive(Debug)]
pub struct Trainer {
    config: TrainerConfig,
    model: SurrogateModel,
    loss: CombinedLoss,
    optimizer: GradientDescent,
    scheduler: LRScheduler,
    early_stopping: Option<EarlyStopping>,
    history: TrainingHistory,
    checkpoints: Option<CheckpointManager>,
    state: TrainerState,
    epoch: usize,
    best_val_loss: Option<f64>,
}

impl Trainer {
    /// Create a trainer that owns `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the checkpoint
    /// directory cannot be created.
    pub fn new(model: SurrogateModel, loss: CombinedLoss, config: TrainerConfig) -> SurrogateResult<Self> {
        config.validate()?;
        let optimizer = GradientDescent::new(config.optimizer)?;
        let scheduler = LRScheduler::new(config.scheduler.clone())?;
        let early_stopping = config
            .early_stopping
            .map(|es| EarlyStopping::new(es.patience, es.min_delta))
            .transpose()?;
        let checkpoints = config
            .checkpoint_dir
            .as_ref()
            .map(CheckpointManager::new)
            .transpose()?;
        Ok(Self {
            config,
            model,
            loss,
            optimizer,
            scheduler,
            early_stopping,
            history: TrainingHistory::new(),
            checkpoints,
            state: TrainerState::Idle,
            epoch: 0,
            best_val_loss: None,
        })
    }

    /// Training configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Per-epoch records so far, including any restored by [`resume_from`](Self::resume_from).
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Read-only access to the model between epochs.
    pub fn model(&self) -> &SurrogateModel {
        &self.model
    }

    /// Release the trained model.
    pub fn into_model(self) -> SurrogateModel {
        self.model
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Lowest validation loss seen.
    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    /// Checkpoint manager, when a checkpoint directory is configured.
    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    /// Restore parameters and loop state from a checkpoint and continue from
    /// its epoch on the next [`train`](Self::train).
    pub fn resume_from(&mut self, path: impl AsRef<Path>) -> SurrogateResult<()> {
        let stored = read_header(path.as_ref())?;
        if let (Some(ours), Some(theirs)) = (self.loss.weights(), stored.loss_weights) {
            if ours != theirs {
                return Err(SurrogateError::checkpoint_mismatch(
                    "loss_weights",
                    format!("{ours:?}"),
                    format!("{theirs:?}"),
                ));
            }
        }
        let header = load_checkpoint(path.as_ref(), &self.model, Some(&mut self.optimizer))?;
        self.scheduler = header.scheduler;
        match header.early_stopping {
            Some(saved) if self.early_stopping.is_some() => self.early_stopping = Some(saved),
            None => {
                if let Some(configured) = &self.early_stopping {
                    tracing::warn!(
                        patience = configured.patience(),
                        "checkpoint has no early stopping state; keeping the configured stopper"
                    );
                }
            }
            Some(_) => {}
        }
        self.history = header.history;
        self.epoch = header.epoch;
        self.best_val_loss = header.best_val_loss;
        self.state = TrainerState::Idle;
        tracing::info!(epoch = self.epoch, path = %path.as_ref().display(), "resumed training");
        Ok(())
    }

    /// Run epochs until convergence, early stopping or failure.
    ///
    /// # Errors
    ///
    /// `Data` if either dataset cannot be batched, before any state changes.
    /// `NumericalInstability` if a loss or gradient is non-finite; the state
    /// becomes `Failed` and history and checkpoints stay at the last good epoch.
    /// A failure to write checkpoints or history also leaves the state `Failed`.
    pub fn train(&mut self, train: &TrajectoryDataset, val: &TrajectoryDataset) -> SurrogateResult<TrainerState> {
        let num_batches = train
            .iter_batches(self.config.batch_size, false, 0)?
            .num_batches();
        val.iter_batches(self.config.batch_size.min(val.len()), false, 0)?;

        tracing::info!(
            epochs = self.config.epochs,
            start_epoch = self.epoch,
            train = train.len(),
            val = val.len(),
            parameters = self.model.parameter_count(),
            "starting training"
        );

        let pb = self.progress_bar(num_batches);
        let started = Instant::now();
        let elapsed_before = self.history.last().map_or(0.0, |r| r.wall_time_secs);

        while self.epoch < self.config.epochs {
            let epoch = self.epoch;
            self.state = TrainerState::Running { epoch };
            let lr = self.scheduler.get_lr();

            let (train_loss, max_grad_norm) = match self.run_epoch(train, epoch, lr, &pb) {
                Ok(result) => result,
                Err(e) => return Err(self.fail(epoch, e)),
            };
            let val_breakdown = match self.validation_loss(val, epoch) {
                Ok(result) => result,
                Err(e) => return Err(self.fail(epoch, e)),
            };
            let val_loss = val_breakdown.total;

            let record = EpochRecord {
                epoch,
                train_loss,
                val_loss,
                learning_rate: lr,
                wall_time_secs: elapsed_before + started.elapsed().as_secs_f64(),
                max_grad_norm,
                val_terms: val_breakdown.terms,
            };
            if let Err(e) = self.history.push(record) {
                return Err(self.fail(epoch, e));
            }
            self.epoch += 1;
            self.scheduler.step();

            let improved = self.best_val_loss.map_or(true, |best| val_loss < best);
            if improved {
                self.best_val_loss = Some(val_loss);
            }
            let stop = self
                .early_stopping
                .as_mut()
                .is_some_and(|es| es.step(val_loss));

            if let Err(e) = self.persist(improved) {
                pb.finish_and_clear();
                return Err(self.fail(epoch, e));
            }

            tracing::info!(
                epoch,
                train_loss,
                val_loss,
                lr,
                max_grad_norm,
                improved,
                "epoch complete"
            );

            if stop {
                tracing::info!(epoch, "early stopping");
                self.state = TrainerState::Stopped { epoch };
                pb.finish_and_clear();
                return Ok(self.state.clone());
            }
            if self.config.target_loss.is_some_and(|target| val_loss <= target) {
                tracing::info!(epoch, val_loss, "target loss reached");
                self.state = TrainerState::Converged {
                    epoch,
                    reason: ConvergenceReason::TargetLoss,
                };
                pb.finish_and_clear();
                return Ok(self.state.clone());
            }
        }

        pb.finish_and_clear();
        self.state = TrainerState::Converged {
            epoch: self.epoch.saturating_sub(1),
            reason: ConvergenceReason::MaxEpochs,
        };
        tracing::info!(epochs = self.epoch, best_val_loss = ?self.best_val_loss, "training complete");
        Ok(self.state.clone())
    }

    fn progress_bar(&self, num_batches: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let remaining = self.config.epochs.saturating_sub(self.epoch) * num_batches;
        let pb = ProgressBar::new(remaining as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    fn fail(&mut self, epoch: usize, error: SurrogateError) -> SurrogateError {
        tracing::warn!(epoch, error = %error, "training failed");
        self.state = TrainerState::Failed {
            epoch,
            detail: error.to_string(),
        };
        error
    }

    /// One pass over the training set; returns (mean loss, max grad norm).
    fn run_epoch(
        &mut self,
        train: &TrajectoryDataset,
        epoch: usize,
        lr: f64,
        pb: &ProgressBar,
    ) -> SurrogateResult<(f64, f64)> {
        let seed = self.config.seed.wrapping_add(epoch as u64);
        let batches = train.iter_batches(self.config.batch_size, self.config.shuffle, seed)?;

        let mut weighted_loss = 0.0;
        let mut seen = 0usize;
        let mut max_grad_norm = 0.0f64;
        for (batch_idx, examples) in batches.enumerate() {
            let batch = SurrogateBatch::collate(&examples, self.model.config(), self.model.device())?;
            let output = self.model.forward(&batch)?;
            let loss = self.loss.compute(&output, &batch.targets)?;
            if !loss.breakdown.is_finite() {
                return Err(SurrogateError::instability(
                    epoch,
                    batch_idx,
                    format!("non-finite training loss {:?}", loss.breakdown),
                ));
            }

            let grads = loss.total.backward()?;
            let params = self.model.parameters()?;
            let stats = match self.optimizer.step(&params, &grads, lr)? {
                StepOutcome::Applied(stats) => stats,
                StepOutcome::NonFinite { parameter } => {
                    return Err(SurrogateError::instability(
                        epoch,
                        batch_idx,
                        format!("non-finite gradient for {parameter}"),
                    ));
                }
            };

            max_grad_norm = max_grad_norm.max(stats.grad_norm);
            weighted_loss += loss.breakdown.total * examples.len() as f64;
            seen += examples.len();
            tracing::debug!(
                epoch,
                batch = batch_idx,
                loss = loss.breakdown.total,
                grad_norm = stats.grad_norm,
                clipped = stats.clipped,
                "training step"
            );
            pb.set_message(format!("{:.4}", loss.breakdown.total));
            pb.inc(1);
        }
        Ok((weighted_loss / seen.max(1) as f64, max_grad_norm))
    }

    /// Mean validation loss per term, without touching parameters.
    pub fn validation_loss(&self, val: &TrajectoryDataset, epoch: usize) -> SurrogateResult<LossBreakdown> {
        let batch_size = self.config.batch_size.min(val.len());
        let mut sum = LossBreakdown::default();
        let mut seen = 0usize;
        for (batch_idx, examples) in val.iter_batches(batch_size, false, 0)?.enumerate() {
            let batch = SurrogateBatch::collate(&examples, self.model.config(), self.model.device())?;
            let output = self.model.forward(&batch)?;
            let loss = self.loss.compute(&output, &batch.targets)?;
            if !loss.breakdown.is_finite() {
                return Err(SurrogateError::instability(
                    epoch,
                    batch_idx,
                    format!("non-finite validation loss {:?}", loss.breakdown),
                ));
            }
            sum.accumulate(&loss.breakdown, examples.len() as f64);
            seen += examples.len();
        }
        Ok(sum.scaled(seen.max(1) as f64))
    }

    fn header(&self) -> CheckpointHeader {
        CheckpointHeader {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            architecture: self.model.config().clone(),
            loss_weights: self.loss.weights(),
            epoch: self.epoch,
            scheduler: self.scheduler.clone(),
            early_stopping: self.early_stopping.clone(),
            optimizer: self.optimizer.state(),
            best_val_loss: self.best_val_loss,
            history: self.history.clone(),
            created_at: Utc::now(),
        }
    }

    /// Write the last (and if improved, best) checkpoint and the history file.
    fn persist(&self, improved: bool) -> SurrogateResult<()> {
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        let header = self.header();
        manager.save_last(&header, &self.model, &self.optimizer)?;
        if improved {
            manager.save_best(&header, &self.model, &self.optimizer)?;
        }
        self.history.save(manager.dir().join(HISTORY_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurrogateConfig;
    use crate::data::CouplingBounds;
    use crate::engine::LinearFlow;
    use crate::loss::LossWeights;
    use crate::optimizer::UpdateRule;
    use candle_core::{Device, Tensor};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::TempDir;

    fn datasets() -> (TrajectoryDataset, TrajectoryDataset) {
        let flow = LinearFlow::new([0.8, 1.2, 0.5], [0.3, 0.6, 0.9]);
        let data = TrajectoryDataset::generate(&flow, 7, 24, CouplingBounds::uniform(0.1, 2.0), 8).unwrap();
        data.split(0.75, 3).unwrap()
    }

    fn trainer(config: TrainerConfig, seed: u64) -> Trainer {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let model = SurrogateModel::new(&SurrogateConfig::test(), &Device::Cpu, &mut rng).unwrap();
        Trainer::new(model, CombinedLoss::new(LossWeights::default()).unwrap(), config).unwrap()
    }

    fn config(epochs: usize) -> TrainerConfig {
        TrainerConfig {
            epochs,
            batch_size: 6,
            scheduler: SchedulerType::Constant { lr: 1e-3 },
            optimizer: OptimizerConfig {
                rule: UpdateRule::adam(),
                weight_decay: 0.0,
                max_grad_norm: Some(1.0),
            },
            early_stopping: None,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn test_runs_to_max_epochs() {
        let (train, val) = datasets();
        let mut t = trainer(config(3), 0);
        assert_eq!(t.state(), &TrainerState::Idle);
        let state = t.train(&train, &val).unwrap();
        assert_eq!(
            state,
            TrainerState::Converged {
                epoch: 2,
                reason: ConvergenceReason::MaxEpochs
            }
        );
        assert_eq!(t.history().len(), 3);
        assert!(t.history().records().iter().all(|r| r.val_loss.is_finite()));
        assert!(t.history().records()[0].val_term("coupling").is_some());
    }

    #[test]
    fn test_target_loss_converges_early() {
        let (train, val) = datasets();
        let mut t = trainer(
            TrainerConfig {
                target_loss: Some(1e9),
                ..config(5)
            },
            0,
        );
        let state = t.train(&train, &val).unwrap();
        assert_eq!(
            state,
            TrainerState::Converged {
                epoch: 0,
                reason: ConvergenceReason::TargetLoss
            }
        );
    }

    #[test]
    fn test_identical_seeds_give_identical_history() {
        let (train, val) = datasets();
        let mut a = trainer(config(2), 11);
        let mut b = trainer(config(2), 11);
        a.train(&train, &val).unwrap();
        b.train(&train, &val).unwrap();
        assert!(a.history().same_outcome(b.history()));
    }

    #[test]
    fn test_oversized_batch_is_data_error() {
        let (train, val) = datasets();
        let mut t = trainer(
            TrainerConfig {
                batch_size: 1000,
                ..config(2)
            },
            0,
        );
        assert!(matches!(t.train(&train, &val), Err(SurrogateError::Data(_))));
        assert_eq!(t.state(), &TrainerState::Idle);
    }

    #[test]
    fn test_nan_parameter_fails_without_update() {
        let (train, val) = datasets();
        let mut t = trainer(config(2), 0);
        let (_, poisoned) = t.model().parameters().unwrap().remove(0);
        poisoned
            .set(&Tensor::full(f32::NAN, poisoned.dims(), &Device::Cpu).unwrap())
            .unwrap();
        let (name, untouched) = t.model().parameters().unwrap().remove(1);
        let before: Vec<f32> = untouched.as_tensor().flatten_all().unwrap().to_vec1().unwrap();

        match t.train(&train, &val) {
            Err(SurrogateError::NumericalInstability { epoch, batch, .. }) => {
                assert_eq!((epoch, batch), (0, 0));
            }
            other => panic!("expected instability, got {other:?}"),
        }
        assert!(matches!(t.state(), TrainerState::Failed { epoch: 0, .. }));
        assert!(t.history().is_empty());
        let after: Vec<f32> = untouched.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after, "{name} changed");
    }

    #[test]
    fn test_checkpoints_and_history_written() {
        let (train, val) = datasets();
        let dir = TempDir::new().unwrap();
        let mut t = trainer(
            TrainerConfig {
                checkpoint_dir: Some(dir.path().to_path_buf()),
                ..config(2)
            },
            0,
        );
        t.train(&train, &val).unwrap();
        let manager = t.checkpoints().unwrap();
        assert!(manager.has_last());
        assert!(manager.has_best());
        let history = TrainingHistory::load(dir.path().join(HISTORY_FILE)).unwrap();
        assert_eq!(&history, t.history());
    }

    #[test]
    fn test_write_failure_ends_in_failed_state() {
        let (train, val) = datasets();
        let dir = TempDir::new().unwrap();
        let ckpt_dir = dir.path().join("ckpts");
        let mut t = trainer(
            TrainerConfig {
                checkpoint_dir: Some(ckpt_dir.clone()),
                ..config(3)
            },
            0,
        );
        // a plain file where the checkpoint directory should be
        std::fs::remove_dir_all(&ckpt_dir).unwrap();
        std::fs::write(&ckpt_dir, b"not a directory").unwrap();

        assert!(t.train(&train, &val).is_err());
        assert!(t.state().is_terminal());
        assert!(matches!(t.state(), TrainerState::Failed { epoch: 0, .. }));
        assert_eq!(t.history().len(), 1);
    }

    #[test]
    fn test_resume_keeps_configured_early_stopping() {
        let (train, val) = datasets();
        let dir = TempDir::new().unwrap();
        let with_dir = |epochs| TrainerConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..config(epochs)
        };
        let mut first = trainer(with_dir(1), 0);
        first.train(&train, &val).unwrap();
        let last = first.checkpoints().unwrap().last_path();

        let mut resumed = trainer(
            TrainerConfig {
                early_stopping: Some(EarlyStoppingConfig {
                    patience: 2,
                    min_delta: 0.0,
                }),
                ..with_dir(2)
            },
            0,
        );
        resumed.resume_from(&last).unwrap();
        let stopper = resumed.early_stopping.as_ref().unwrap();
        assert_eq!(stopper.patience(), 2);
        assert_eq!(stopper.best(), None);
    }

    #[test]
    fn test_invalid_config() {
        assert!(TrainerConfig {
            epochs: 0,
            ..TrainerConfig::default()
        }
        .validate()
        .is_err());
        assert!(TrainerConfig {
            target_loss: Some(f64::NAN),
            ..TrainerConfig::default()
        }
        .validate()
        .is_err());
        TrainerConfig::default().validate().unwrap();
    }
}
