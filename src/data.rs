//! Trajectory datasets, batching and tensor collation.
//!
//! Samples are generated independently by a [`GroundTruth`] integrator in
//! parallel and merged by sample index, so the dataset depends only on the
//! seed. Failed integrations are excluded and recorded in a [`DatasetReport`].

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SurrogateConfig;
use crate::engine::{GroundTruth, Integration};
use crate::error::{SurrogateError, SurrogateResult};
use crate::loss::LossTargets;
use crate::state::{CouplingState, HolographicState, EDGE_FEATURES, NODE_FEATURES};

/// Inclusive ranges for sampling initial couplings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingBounds {
    /// Range for λ
    pub lambda: (f64, f64),
    /// Range for γ
    pub gamma: (f64, f64),
    /// Range for μ
    pub mu: (f64, f64),
}

impl Default for CouplingBounds {
    fn default() -> Self {
        Self::uniform(0.1, 2.0)
    }
}

impl CouplingBounds {
    /// Same range for all three couplings.
    pub const fn uniform(low: f64, high: f64) -> Self {
        Self {
            lambda: (low, high),
            gamma: (low, high),
            mu: (low, high),
        }
    }

    fn ranges(&self) -> [(f64, f64); 3] {
        [self.lambda, self.gamma, self.mu]
    }

    /// Draw one coupling triple.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> [f64; 3] {
        self.ranges().map(|(low, high)| {
            if high > low {
                rng.gen_range(low..=high)
            } else {
                low
            }
        })
    }

    /// Check that each range is finite and ordered.
    pub fn validate(&self) -> SurrogateResult<()> {
        for (low, high) in self.ranges() {
            if !low.is_finite() || !high.is_finite() || low > high {
                return Err(SurrogateError::configuration(format!(
                    "invalid coupling range [{low}, {high}]"
                )));
            }
        }
        Ok(())
    }
}

/// Settings for [`TrajectoryDataset::generate_with_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Master seed for initial conditions and per-sample seeds
    pub seed: u64,
    /// Number of samples requested
    pub n_samples: usize,
    /// Ranges for initial couplings
    pub bounds: CouplingBounds,
    /// Integration steps per sample
    pub n_steps: usize,
    /// Step size in ln k
    pub step_size: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            n_samples: 1000,
            bounds: CouplingBounds::default(),
            n_steps: 50,
            step_size: 0.1,
        }
    }
}

impl DatasetConfig {
    /// Validate the generation settings.
    pub fn validate(&self) -> SurrogateResult<()> {
        if self.n_samples == 0 || self.n_steps == 0 {
            return Err(SurrogateError::configuration(
                "n_samples and n_steps must be positive",
            ));
        }
        if !(self.step_size > 0.0) || !self.step_size.is_finite() {
            return Err(SurrogateError::configuration(format!(
                "step_size must be positive, got {}",
                self.step_size
            )));
        }
        self.bounds.validate()
    }
}

/// Parameters that reproduce one sample from its generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Seed passed to the integrator
    pub seed: u64,
    /// Integration steps
    pub n_steps: usize,
    /// Step size in ln k
    pub step_size: f64,
}

/// One supervised sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrainingExample")]
pub struct TrainingExample {
    initial: CouplingState,
    trajectory: HolographicState,
    terminal: CouplingState,
    fixed_point: bool,
    action: f64,
    params: GenerationParams,
}

#[derive(Deserialize)]
struct RawTrainingExample {
    initial: CouplingState,
    trajectory: HolographicState,
    terminal: CouplingState,
    fixed_point: bool,
    action: f64,
    params: GenerationParams,
}

impl TryFrom<RawTrainingExample> for TrainingExample {
    type Error = SurrogateError;

    /// The endpoints must be the trajectory's own first and last states.
    fn try_from(raw: RawTrainingExample) -> SurrogateResult<Self> {
        if raw.initial != *raw.trajectory.initial() {
            return Err(SurrogateError::data("initial state differs from the trajectory start"));
        }
        if raw.terminal != *raw.trajectory.current() {
            return Err(SurrogateError::data("terminal state differs from the trajectory end"));
        }
        if !raw.action.is_finite() {
            return Err(SurrogateError::data(format!("action {} is not finite", raw.action)));
        }
        Ok(Self {
            initial: raw.initial,
            trajectory: raw.trajectory,
            terminal: raw.terminal,
            fixed_point: raw.fixed_point,
            action: raw.action,
            params: raw.params,
        })
    }
}

impl TrainingExample {
    /// Build an example from an integrator output.
    pub fn from_integration(integration: Integration, params: GenerationParams) -> Self {
        let initial = *integration.trajectory.initial();
        let terminal = *integration.trajectory.current();
        Self {
            initial,
            trajectory: integration.trajectory,
            terminal,
            fixed_point: integration.fixed_point_reached,
            action: integration.action,
            params,
        }
    }

    /// Initial state.
    pub fn initial(&self) -> &CouplingState {
        &self.initial
    }

    /// Full trajectory.
    pub fn trajectory(&self) -> &HolographicState {
        &self.trajectory
    }

    /// Terminal state.
    pub fn terminal(&self) -> &CouplingState {
        &self.terminal
    }

    /// Fixed-point label.
    pub fn fixed_point(&self) -> bool {
        self.fixed_point
    }

    /// Action target.
    pub fn action(&self) -> f64 {
        self.action
    }

    /// Generation parameters.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// The observed prefix given to the encoder.
    pub fn context(&self, context_len: usize) -> HolographicState {
        self.trajectory.prefix(context_len)
    }

    /// Trajectory indices the decoder is trained to reach, last = terminal.
    pub fn target_indices(&self, context_len: usize, horizon: usize) -> Vec<usize> {
        let anchor = context_len.clamp(1, self.trajectory.len()) - 1;
        let remaining = self.trajectory.len() - 1 - anchor;
        (1..=horizon)
            .map(|h| anchor + h * remaining / horizon)
            .collect()
    }
}

/// A sample the generator could not integrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFailure {
    /// Sample index within the requested batch
    pub index: usize,
    /// Integration step of the failure
    pub step: usize,
    /// Reported cause
    pub reason: String,
}

/// Outcome of dataset generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetReport {
    /// Samples requested
    pub requested: usize,
    /// Samples kept
    pub valid: usize,
    /// Samples excluded
    pub failures: Vec<SampleFailure>,
}

impl DatasetReport {
    /// Number of excluded samples.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// An immutable collection of training examples.
#[derive(Debug, Clone)]
pub struct TrajectoryDataset {
    examples: Vec<TrainingExample>,
    report: Option<DatasetReport>,
}

impl TrajectoryDataset {
    /// Wrap existing examples.
    pub fn from_examples(examples: Vec<TrainingExample>) -> SurrogateResult<Self> {
        if examples.is_empty() {
            return Err(SurrogateError::data("dataset is empty"));
        }
        Ok(Self {
            examples,
            report: None,
        })
    }

    /// Generate `n_samples` trajectories with the default step size.
    pub fn generate<G: GroundTruth + ?Sized>(
        generator: &G,
        seed: u64,
        n_samples: usize,
        initial_bounds: CouplingBounds,
        n_steps: usize,
    ) -> SurrogateResult<Self> {
        let config = DatasetConfig {
            seed,
            n_samples,
            bounds: initial_bounds,
            n_steps,
            ..DatasetConfig::default()
        };
        Self::generate_with_config(generator, &config)
    }

    /// Generate a dataset from explicit settings.
    pub fn generate_with_config<G: GroundTruth + ?Sized>(
        generator: &G,
        config: &DatasetConfig,
    ) -> SurrogateResult<Self> {
        config.validate()?;

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let jobs: Vec<([f64; 3], u64)> = (0..config.n_samples)
            .map(|_| {
                let initial = config.bounds.sample(&mut rng);
                (initial, rng.gen::<u64>())
            })
            .collect();

        let results: Vec<_> = jobs
            .into_par_iter()
            .map(|(initial, seed)| {
                let params = GenerationParams {
                    seed,
                    n_steps: config.n_steps,
                    step_size: config.step_size,
                };
                generator
                    .integrate(initial, config.n_steps, config.step_size, seed)
                    .map(|integration| TrainingExample::from_integration(integration, params))
            })
            .collect();

        let mut examples = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(example) => examples.push(example),
                Err(failure) => {
                    tracing::warn!(index, step = failure.step, reason = %failure.reason, "excluding sample");
                    failures.push(SampleFailure {
                        index,
                        step: failure.step,
                        reason: failure.reason,
                    });
                }
            }
        }

        let report = DatasetReport {
            requested: config.n_samples,
            valid: examples.len(),
            failures,
        };
        tracing::info!(
            requested = report.requested,
            valid = report.valid,
            failed = report.failure_count(),
            "generated trajectory dataset"
        );

        if examples.is_empty() {
            return Err(SurrogateError::data(format!(
                "all {} samples failed to integrate",
                config.n_samples
            )));
        }
        Ok(Self {
            examples,
            report: Some(report),
        })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// All examples in order.
    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    /// Example by index.
    pub fn get(&self, index: usize) -> Option<&TrainingExample> {
        self.examples.get(index)
    }

    /// Generation report, present for generated datasets.
    pub fn report(&self) -> Option<&DatasetReport> {
        self.report.as_ref()
    }

    /// Deterministic disjoint train/validation partition.
    pub fn split(&self, train_fraction: f64, seed: u64) -> SurrogateResult<(Self, Self)> {
        if !(train_fraction > 0.0 && train_fraction < 1.0) {
            return Err(SurrogateError::data(format!(
                "train_fraction must lie in (0, 1), got {train_fraction}"
            )));
        }
        let n_train = (self.len() as f64 * train_fraction).round() as usize;
        if n_train == 0 || n_train >= self.len() {
            return Err(SurrogateError::data(format!(
                "split of {} examples at {train_fraction} leaves a partition empty",
                self.len()
            )));
        }

        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let (train, val) = indices.split_at_mut(n_train);
        train.sort_unstable();
        val.sort_unstable();

        let pick = |idx: &[usize]| Self {
            examples: idx.iter().map(|&i| self.examples[i].clone()).collect(),
            report: None,
        };
        Ok((pick(train), pick(val)))
    }

    /// Lazy batch iterator; shuffled order depends only on `seed`.
    pub fn iter_batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> SurrogateResult<BatchIter<'_>> {
        if self.is_empty() {
            return Err(SurrogateError::data("dataset is empty"));
        }
        if batch_size == 0 || batch_size > self.len() {
            return Err(SurrogateError::data(format!(
                "batch_size {batch_size} invalid for dataset of {} examples",
                self.len()
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        }
        Ok(BatchIter {
            dataset: self,
            order,
            batch_size,
            cursor: 0,
        })
    }
}

/// Restartable iterator over batches of example references.
#[derive(Debug, Clone)]
pub struct BatchIter<'a> {
    dataset: &'a TrajectoryDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl BatchIter<'_> {
    /// Restart from the first batch with the same order.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Total number of batches per pass.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Vec<&'a TrainingExample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.dataset.examples[i])
            .collect();
        self.cursor = end;
        Some(batch)
    }
}

/// Padded encoder inputs for a batch of trajectories.
#[derive(Debug, Clone)]
pub struct EncoderInput {
    /// Node features (B, N, 4)
    pub nodes: Tensor,
    /// Edge features aligned to nodes (B, N, 3)
    pub edges: Tensor,
    /// 1 for real nodes, 0 for padding (B, N)
    pub key_mask: Tensor,
}

impl EncoderInput {
    /// Pad and stack trajectories into tensors.
    pub fn from_states(states: &[&HolographicState], device: &Device) -> SurrogateResult<Self> {
        if states.is_empty() {
            return Err(SurrogateError::data("cannot encode an empty batch"));
        }
        let batch = states.len();
        let max_len = states.iter().map(|s| s.len()).max().unwrap_or(1);

        let mut nodes = vec![0.0f32; batch * max_len * NODE_FEATURES];
        let mut edges = vec![0.0f32; batch * max_len * EDGE_FEATURES];
        let mut mask = vec![0.0f32; batch * max_len];
        for (b, state) in states.iter().enumerate() {
            let n = state.len();
            let node_off = b * max_len * NODE_FEATURES;
            nodes[node_off..node_off + n * NODE_FEATURES].copy_from_slice(&state.node_features());
            let edge_off = b * max_len * EDGE_FEATURES;
            edges[edge_off..edge_off + n * EDGE_FEATURES].copy_from_slice(&state.edge_features());
            mask[b * max_len..b * max_len + n].fill(1.0);
        }

        Ok(Self {
            nodes: Tensor::from_vec(nodes, (batch, max_len, NODE_FEATURES), device)?,
            edges: Tensor::from_vec(edges, (batch, max_len, EDGE_FEATURES), device)?,
            key_mask: Tensor::from_vec(mask, (batch, max_len), device)?,
        })
    }
}

/// Decoder input token: couplings to advance from, scale to advance to.
pub fn decoder_token(from: &CouplingState, target_scale: f64) -> [f32; NODE_FEATURES] {
    [
        from.lambda as f32,
        from.gamma as f32,
        from.mu as f32,
        target_scale as f32,
    ]
}

/// A collated training batch.
#[derive(Debug, Clone)]
pub struct SurrogateBatch {
    /// Encoder inputs built from each example's context
    pub encoder: EncoderInput,
    /// Teacher-forced decoder tokens (B, H, 4)
    pub tokens: Tensor,
    /// Supervision for the three heads
    pub targets: LossTargets,
}

impl SurrogateBatch {
    /// Collate examples using the context length and horizon of `config`.
    pub fn collate(
        examples: &[&TrainingExample],
        config: &SurrogateConfig,
        device: &Device,
    ) -> SurrogateResult<Self> {
        if examples.is_empty() {
            return Err(SurrogateError::data("cannot collate an empty batch"));
        }
        let batch = examples.len();
        let horizon = config.horizon;

        let contexts: Vec<HolographicState> = examples
            .iter()
            .map(|e| e.context(config.context_len))
            .collect();
        let context_refs: Vec<&HolographicState> = contexts.iter().collect();
        let encoder = EncoderInput::from_states(&context_refs, device)?;

        let mut tokens = Vec::with_capacity(batch * horizon * NODE_FEATURES);
        let mut couplings = Vec::with_capacity(batch * horizon * 3);
        let mut fixed_point = Vec::with_capacity(batch);
        let mut action = Vec::with_capacity(batch);
        for (example, context) in examples.iter().zip(&contexts) {
            let nodes = example.trajectory().nodes();
            let mut from = *context.current();
            for idx in example.target_indices(config.context_len, horizon) {
                let target = &nodes[idx];
                tokens.extend_from_slice(&decoder_token(&from, target.scale));
                couplings.extend(target.couplings().map(|c| c as f32));
                from = *target;
            }
            fixed_point.push(if example.fixed_point() { 1.0f32 } else { 0.0 });
            action.push(example.action() as f32);
        }

        Ok(Self {
            encoder,
            tokens: Tensor::from_vec(tokens, (batch, horizon, NODE_FEATURES), device)?,
            targets: LossTargets {
                couplings: Tensor::from_vec(couplings, (batch, horizon, 3), device)?,
                fixed_point: Tensor::from_vec(fixed_point, (batch, 1), device)?,
                action: Tensor::from_vec(action, (batch, 1), device)?,
            },
        })
    }

    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.tokens.dims()[0]
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LinearFlow;
    use crate::error::ConvergenceFailure;

    fn flow() -> LinearFlow {
        LinearFlow::new([1.0, 0.5, 2.0], [0.2, 0.4, 0.6]).with_tolerance(0.1)
    }

    fn dataset(n: usize) -> TrajectoryDataset {
        TrajectoryDataset::generate(&flow(), 7, n, CouplingBounds::uniform(0.5, 1.5), 10).unwrap()
    }

    /// Fails for every sample whose initial λ is above 1.
    struct Picky;

    impl GroundTruth for Picky {
        fn integrate(
            &self,
            initial: [f64; 3],
            n_steps: usize,
            step_size: f64,
            seed: u64,
        ) -> Result<Integration, ConvergenceFailure> {
            if initial[0] > 1.0 {
                return Err(ConvergenceFailure::new(3, "blew up"));
            }
            flow().integrate(initial, n_steps, step_size, seed)
        }
    }

    #[test]
    fn test_example_deserialization_is_checked() {
        let data = dataset(1);
        let example = data.get(0).unwrap();
        let json = serde_json::to_value(example).unwrap();
        let back: TrainingExample = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(&back, example);

        let mut moved = json.clone();
        moved["terminal"]["lambda"] = serde_json::json!(99.0);
        assert!(serde_json::from_value::<TrainingExample>(moved).is_err());

        let mut empty = json;
        empty["trajectory"] = serde_json::json!({"nodes": [], "edges": []});
        let err = serde_json::from_value::<TrainingExample>(empty).unwrap_err();
        assert!(err.to_string().contains("at least one state"), "{err}");
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = dataset(20);
        let b = dataset(20);
        assert_eq!(a.len(), 20);
        assert_eq!(a.examples(), b.examples());
        assert_eq!(a.report().unwrap().failure_count(), 0);
    }

    #[test]
    fn test_failures_excluded_and_counted() {
        let ds = TrajectoryDataset::generate(&Picky, 3, 50, CouplingBounds::uniform(0.5, 1.5), 5)
            .unwrap();
        let report = ds.report().unwrap();
        assert_eq!(report.requested, 50);
        assert_eq!(report.valid + report.failure_count(), 50);
        assert!(report.failure_count() > 0);
        assert_eq!(ds.len(), report.valid);
        assert!(ds.examples().iter().all(|e| e.initial().lambda <= 1.0));
    }

    #[test]
    fn test_all_failures_is_data_error() {
        let result =
            TrajectoryDataset::generate(&Picky, 3, 10, CouplingBounds::uniform(1.1, 1.5), 5);
        assert!(matches!(result, Err(SurrogateError::Data(_))));
    }

    #[test]
    fn test_split_disjoint_and_deterministic() {
        let ds = dataset(30);
        let (train, val) = ds.split(0.8, 11).unwrap();
        let (train2, _) = ds.split(0.8, 11).unwrap();
        assert_eq!(train.len(), 24);
        assert_eq!(val.len(), 6);
        assert_eq!(train.examples(), train2.examples());
        for example in val.examples() {
            assert!(!train.examples().contains(example));
        }
        assert!(ds.split(1.0, 0).is_err());
    }

    #[test]
    fn test_batches_reproducible_and_complete() {
        let ds = dataset(10);
        let order = |seed| -> Vec<f64> {
            ds.iter_batches(3, true, seed)
                .unwrap()
                .flatten()
                .map(|e| e.initial().lambda)
                .collect()
        };
        assert_eq!(order(5), order(5));
        assert_ne!(order(5), order(6));

        let mut iter = ds.iter_batches(3, false, 0).unwrap();
        assert_eq!(iter.num_batches(), 4);
        let sizes: Vec<usize> = iter.by_ref().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert!(iter.next().is_none());
        iter.reset();
        assert_eq!(iter.count(), 4);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let ds = dataset(5);
        assert!(matches!(
            ds.iter_batches(6, false, 0),
            Err(SurrogateError::Data(_))
        ));
        assert!(ds.iter_batches(0, false, 0).is_err());
    }

    #[test]
    fn test_target_indices_end_at_terminal() {
        let ds = dataset(1);
        let example = &ds.examples()[0];
        assert_eq!(example.trajectory().len(), 11);
        assert_eq!(example.target_indices(4, 1), vec![10]);
        assert_eq!(example.target_indices(4, 7), vec![4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(example.target_indices(11, 2), vec![10, 10]);
    }

    #[test]
    fn test_collate_shapes() {
        let ds = dataset(4);
        let config = SurrogateConfig::test().with_horizon(3);
        let refs: Vec<&TrainingExample> = ds.examples().iter().collect();
        let batch = SurrogateBatch::collate(&refs, &config, &Device::Cpu).unwrap();

        assert_eq!(batch.len(), 4);
        assert_eq!(batch.encoder.nodes.dims(), &[4, config.context_len, 4]);
        assert_eq!(batch.encoder.edges.dims(), &[4, config.context_len, 3]);
        assert_eq!(batch.tokens.dims(), &[4, 3, 4]);
        assert_eq!(batch.targets.couplings.dims(), &[4, 3, 3]);
        assert_eq!(batch.targets.fixed_point.dims(), &[4, 1]);

        // last target is the terminal state
        let last: Vec<f32> = batch
            .targets
            .couplings
            .narrow(1, 2, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let terminal = ds.examples()[0].terminal().couplings();
        assert!((last[0] as f64 - terminal[0]).abs() < 1e-6);
    }

    #[test]
    fn test_encoder_input_padding() {
        let long = HolographicState::from_states(
            (0..3)
                .map(|i| CouplingState::new(1.0, 1.0, 1.0, 1.0 / (i + 1) as f64))
                .collect(),
        )
        .unwrap();
        let short = HolographicState::single(CouplingState::new(2.0, 2.0, 2.0, 1.0));
        let input = EncoderInput::from_states(&[&long, &short], &Device::Cpu).unwrap();
        let mask: Vec<Vec<f32>> = input.key_mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0, 1.0], vec![1.0, 0.0, 0.0]]);
    }
}
