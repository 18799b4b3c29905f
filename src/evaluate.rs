//! Held-out evaluation and the surrogate-vs-integrator speedup benchmark.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::data::{TrainingExample, TrajectoryDataset};
use crate::engine::GroundTruth;
use crate::error::{SurrogateError, SurrogateResult};
use crate::model::{Prediction, SurrogateModel, FIXED_POINT_THRESHOLD};

/// Schema version of [`EvaluationReport`].
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Targets smaller than this are left out of MAPE.
pub const MAPE_EPSILON: f64 = 1e-12;

const COUPLING_NAMES: [&str; 3] = ["lambda", "gamma", "mu"];

/// Anything that can make terminal predictions for examples.
pub trait SurrogatePredictor {
    /// One prediction per example, in order.
    fn predict_examples(&self, examples: &[&TrainingExample]) -> SurrogateResult<Vec<Prediction>>;
}

impl SurrogatePredictor for SurrogateModel {
    fn predict_examples(&self, examples: &[&TrainingExample]) -> SurrogateResult<Vec<Prediction>> {
        SurrogateModel::predict_examples(self, examples)
    }
}

/// Evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Probability above which a state is classified as a fixed point
    pub threshold: f64,
    /// Examples per inference batch
    pub batch_size: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            threshold: FIXED_POINT_THRESHOLD,
            batch_size: 64,
        }
    }
}

impl EvaluatorConfig {
    /// Validate the threshold and batch size.
    pub fn validate(&self) -> SurrogateResult<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(SurrogateError::configuration(format!(
                "threshold must lie in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(SurrogateError::configuration("evaluation batch_size must be positive"));
        }
        Ok(())
    }
}

/// Regression metrics over paired predictions and targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Mean squared error
    pub mse: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Mean absolute percentage error, in percent
    pub mape: f64,
    /// Coefficient of determination
    pub r2: f64,
}

impl RegressionMetrics {
    /// Compute metrics; both slices must have the same non-zero length.
    pub fn from_pairs(predicted: &[f64], target: &[f64]) -> SurrogateResult<Self> {
        if predicted.len() != target.len() || target.is_empty() {
            return Err(SurrogateError::data(format!(
                "cannot compare {} predictions with {} targets",
                predicted.len(),
                target.len()
            )));
        }
        let n = target.len() as f64;
        let mean = target.iter().sum::<f64>() / n;

        let (mut ss_res, mut abs, mut ss_tot) = (0.0, 0.0, 0.0);
        let (mut pct, mut pct_count) = (0.0, 0usize);
        for (&p, &y) in predicted.iter().zip(target) {
            let err = p - y;
            ss_res += err * err;
            abs += err.abs();
            ss_tot += (y - mean) * (y - mean);
            if y.abs() >= MAPE_EPSILON {
                pct += (err / y).abs();
                pct_count += 1;
            }
        }

        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };
        Ok(Self {
            mse: ss_res / n,
            mae: abs / n,
            mape: if pct_count > 0 {
                100.0 * pct / pct_count as f64
            } else {
                0.0
            },
            r2,
        })
    }
}

/// Binary confusion counts for the fixed-point head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Fixed points predicted as fixed points
    pub true_positive: usize,
    /// Fixed points that were missed
    pub false_negative: usize,
    /// Flowing trajectories predicted as fixed points
    pub false_positive: usize,
    /// Flowing trajectories predicted as flowing
    pub true_negative: usize,
}

impl ConfusionMatrix {
    /// Matrix from explicit counts.
    pub const fn new(true_positive: usize, false_negative: usize, false_positive: usize, true_negative: usize) -> Self {
        Self {
            true_positive,
            false_negative,
            false_positive,
            true_negative,
        }
    }

    /// Count one prediction.
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positive += 1,
            (false, true) => self.false_negative += 1,
            (true, false) => self.false_positive += 1,
            (false, false) => self.true_negative += 1,
        }
    }

    /// Number of recorded predictions.
    pub fn total(&self) -> usize {
        self.true_positive + self.false_negative + self.false_positive + self.true_negative
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Classification metrics derived from a confusion matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    /// Underlying counts
    pub confusion: ConfusionMatrix,
    /// Fraction of correct decisions
    pub accuracy: f64,
    /// tp / (tp + fp), 0 without positive predictions
    pub precision: f64,
    /// tp / (tp + fn), 0 without positive labels
    pub recall: f64,
    /// Harmonic mean of precision and recall
    pub f1: f64,
}

impl ClassificationMetrics {
    /// Zero denominators yield 0.
    pub fn from_confusion(confusion: ConfusionMatrix) -> Self {
        let ConfusionMatrix {
            true_positive: tp,
            false_negative: fn_,
            false_positive: fp,
            true_negative: tn,
        } = confusion;
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            confusion,
            accuracy: ratio(tp + tn, confusion.total()),
            precision,
            recall,
            f1,
        }
    }
}

/// Source of elapsed time for benchmarks.
pub trait Clock {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Clock starting at the current instant.
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at zero until advanced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Distribution of per-sample times, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    /// Sum over all samples; the remaining fields are per-sample seconds
    pub total_secs: f64,
    pub mean_secs: f64,
    pub median_secs: f64,
    pub p95_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub std_secs: f64,
}

impl TimingStats {
    /// Summarize samples; percentiles use the nearest rank.
    pub fn from_samples(samples: &[f64]) -> SurrogateResult<Self> {
        if samples.is_empty() {
            return Err(SurrogateError::data("no timing samples"));
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let total: f64 = sorted.iter().sum();
        let mean = total / n as f64;
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        let rank = ((0.95 * n as f64).ceil() as usize).clamp(1, n);
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        Ok(Self {
            total_secs: total,
            mean_secs: mean,
            median_secs: median,
            p95_secs: sorted[rank - 1],
            min_secs: sorted[0],
            max_secs: sorted[n - 1],
            std_secs: variance.sqrt(),
        })
    }
}

/// Result of a [`SpeedupBenchmark`] run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedupReport {
    /// Samples timed
    pub n_samples: usize,
    /// Inference batch size
    pub batch_size: usize,
    /// Total integrator time over total surrogate time
    pub speedup: f64,
    /// Per-sample surrogate time (batch time split evenly)
    pub surrogate: TimingStats,
    /// Per-sample integrator time
    pub ground_truth: TimingStats,
    /// Samples the integrator failed on (still timed)
    pub ground_truth_failures: usize,
}

/// Times batched surrogate inference against re-running the integrator.
#[derive(Debug, Clone)]
pub struct SpeedupBenchmark<C> {
    clock: C,
    batch_size: usize,
    warmup: usize,
}

impl<C: Clock> SpeedupBenchmark<C> {
    /// Benchmark that runs the surrogate in batches of `batch_size`.
    pub fn new(clock: C, batch_size: usize) -> SurrogateResult<Self> {
        if batch_size == 0 {
            return Err(SurrogateError::configuration("benchmark batch_size must be positive"));
        }
        Ok(Self {
            clock,
            batch_size,
            warmup: 0,
        })
    }

    /// Untimed surrogate passes over the first batch before measuring.
    #[must_use]
    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Time both predictors on `examples`.
    pub fn run<S, G>(&self, surrogate: &S, generator: &G, examples: &[TrainingExample]) -> SurrogateResult<SpeedupReport>
    where
        S: SurrogatePredictor + ?Sized,
        G: GroundTruth + ?Sized,
    {
        if examples.is_empty() {
            return Err(SurrogateError::data("speedup benchmark needs at least one example"));
        }
        let refs: Vec<&TrainingExample> = examples.iter().collect();

        for _ in 0..self.warmup {
            let end = self.batch_size.min(refs.len());
            surrogate.predict_examples(&refs[..end])?;
        }

        let mut surrogate_times = Vec::with_capacity(refs.len());
        for chunk in refs.chunks(self.batch_size) {
            let start = self.clock.now();
            surrogate.predict_examples(chunk)?;
            let per_sample = self.clock.now().saturating_sub(start).as_secs_f64() / chunk.len() as f64;
            surrogate_times.extend(std::iter::repeat(per_sample).take(chunk.len()));
        }

        let mut truth_times = Vec::with_capacity(refs.len());
        let mut failures = 0;
        for example in &refs {
            let initial = example.initial().couplings();
            let params = example.params();
            let start = self.clock.now();
            let result = generator.integrate(initial, params.n_steps, params.step_size, params.seed);
            truth_times.push(self.clock.now().saturating_sub(start).as_secs_f64());
            if result.is_err() {
                failures += 1;
            }
        }

        let surrogate = TimingStats::from_samples(&surrogate_times)?;
        let ground_truth = TimingStats::from_samples(&truth_times)?;
        // floor at 1 ns
        let speedup = ground_truth.total_secs / surrogate.total_secs.max(1e-9);
        tracing::info!(
            samples = refs.len(),
            speedup,
            surrogate_mean = surrogate.mean_secs,
            ground_truth_mean = ground_truth.mean_secs,
            "speedup benchmark"
        );
        Ok(SpeedupReport {
            n_samples: refs.len(),
            batch_size: self.batch_size,
            speedup,
            surrogate,
            ground_truth,
            ground_truth_failures: failures,
        })
    }
}

/// Structured evaluation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Report format version
    pub schema_version: u32,
    /// Evaluated examples
    pub n_samples: usize,
    /// Fixed-point decision threshold
    pub threshold: f64,
    /// Per coupling dimension, keyed by lambda, gamma and mu
    pub couplings: BTreeMap<String, RegressionMetrics>,
    /// All three dimensions pooled
    pub aggregate: RegressionMetrics,
    /// Fixed-point classification at `threshold`
    pub fixed_point: ClassificationMetrics,
    /// Action regression metrics
    pub action: RegressionMetrics,
    /// Timing comparison, when a benchmark was attached
    pub speedup: Option<SpeedupReport>,
}

impl EvaluationReport {
    /// Attach benchmark results.
    #[must_use]
    pub fn with_speedup(mut self, speedup: SpeedupReport) -> Self {
        self.speedup = Some(speedup);
        self
    }

    /// Flatten to dotted metric names.
    pub fn to_flat_map(&self) -> BTreeMap<String, f64> {
        fn regression(map: &mut BTreeMap<String, f64>, prefix: &str, m: &RegressionMetrics) {
            map.insert(format!("{prefix}.mse"), m.mse);
            map.insert(format!("{prefix}.mae"), m.mae);
            map.insert(format!("{prefix}.mape"), m.mape);
            map.insert(format!("{prefix}.r2"), m.r2);
        }

        let mut map = BTreeMap::new();
        map.insert("n_samples".to_string(), self.n_samples as f64);
        for (name, metrics) in &self.couplings {
            regression(&mut map, &format!("coupling.{name}"), metrics);
        }
        regression(&mut map, "coupling.aggregate", &self.aggregate);
        regression(&mut map, "action", &self.action);

        let fp = &self.fixed_point;
        map.insert("fixed_point.accuracy".to_string(), fp.accuracy);
        map.insert("fixed_point.precision".to_string(), fp.precision);
        map.insert("fixed_point.recall".to_string(), fp.recall);
        map.insert("fixed_point.f1".to_string(), fp.f1);
        map.insert("fixed_point.tp".to_string(), fp.confusion.true_positive as f64);
        map.insert("fixed_point.fn".to_string(), fp.confusion.false_negative as f64);
        map.insert("fixed_point.fp".to_string(), fp.confusion.false_positive as f64);
        map.insert("fixed_point.tn".to_string(), fp.confusion.true_negative as f64);

        if let Some(speedup) = &self.speedup {
            map.insert("speedup.ratio".to_string(), speedup.speedup);
            map.insert("speedup.surrogate.mean_secs".to_string(), speedup.surrogate.mean_secs);
            map.insert("speedup.surrogate.p95_secs".to_string(), speedup.surrogate.p95_secs);
            map.insert("speedup.ground_truth.mean_secs".to_string(), speedup.ground_truth.mean_secs);
            map.insert("speedup.ground_truth.p95_secs".to_string(), speedup.ground_truth.p95_secs);
        }
        map
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> SurrogateResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Computes metrics of a frozen model on held-out data.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    config: EvaluatorConfig,
}

impl Evaluator {
    /// Create an evaluator from a validated configuration.
    pub fn new(config: EvaluatorConfig) -> SurrogateResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Evaluation settings.
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Evaluate terminal predictions against `dataset`.
    pub fn evaluate<S: SurrogatePredictor + ?Sized>(
        &self,
        model: &S,
        dataset: &TrajectoryDataset,
    ) -> SurrogateResult<EvaluationReport> {
        let batch_size = self.config.batch_size.min(dataset.len());
        let mut predictions = Vec::with_capacity(dataset.len());
        for batch in dataset.iter_batches(batch_size, false, 0)? {
            let batch_predictions = model.predict_examples(&batch)?;
            if batch_predictions.len() != batch.len() {
                return Err(SurrogateError::data(format!(
                    "predictor returned {} predictions for {} examples",
                    batch_predictions.len(),
                    batch.len()
                )));
            }
            predictions.extend(batch_predictions);
        }

        let examples = dataset.examples();
        let mut couplings = BTreeMap::new();
        let (mut pooled_pred, mut pooled_true) = (Vec::new(), Vec::new());
        for (dim, name) in COUPLING_NAMES.iter().enumerate() {
            let predicted: Vec<f64> = predictions.iter().map(|p| p.state.couplings()[dim]).collect();
            let target: Vec<f64> = examples.iter().map(|e| e.terminal().couplings()[dim]).collect();
            couplings.insert(name.to_string(), RegressionMetrics::from_pairs(&predicted, &target)?);
            pooled_pred.extend(predicted);
            pooled_true.extend(target);
        }

        let mut confusion = ConfusionMatrix::default();
        for (prediction, example) in predictions.iter().zip(examples) {
            confusion.record(prediction.is_fixed_point(self.config.threshold), example.fixed_point());
        }

        let action_pred: Vec<f64> = predictions.iter().map(|p| p.action).collect();
        let action_true: Vec<f64> = examples.iter().map(|e| e.action()).collect();

        let report = EvaluationReport {
            schema_version: REPORT_SCHEMA_VERSION,
            n_samples: examples.len(),
            threshold: self.config.threshold,
            couplings,
            aggregate: RegressionMetrics::from_pairs(&pooled_pred, &pooled_true)?,
            fixed_point: ClassificationMetrics::from_confusion(confusion),
            action: RegressionMetrics::from_pairs(&action_pred, &action_true)?,
            speedup: None,
        };
        tracing::info!(
            samples = report.n_samples,
            coupling_mse = report.aggregate.mse,
            accuracy = report.fixed_point.accuracy,
            action_r2 = report.action.r2,
            "evaluation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_metrics() {
        let metrics = ClassificationMetrics::from_confusion(ConfusionMatrix::new(8, 2, 1, 9));
        assert!((metrics.accuracy - 0.85).abs() < 1e-12);
        assert!((metrics.precision - 8.0 / 9.0).abs() < 1e-12);
        assert!((metrics.recall - 0.8).abs() < 1e-12);
        assert!((metrics.f1 - 0.842105).abs() < 1e-5);
    }

    #[test]
    fn test_empty_classes_give_zero() {
        let metrics = ClassificationMetrics::from_confusion(ConfusionMatrix::new(0, 0, 0, 5));
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.recall, 0.0);
        assert_eq!(metrics.f1, 0.0);
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[test]
    fn test_regression_metrics() {
        let m = RegressionMetrics::from_pairs(&[1.0, 2.0, 4.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!((m.mse - 1.0 / 3.0).abs() < 1e-12);
        assert!((m.mae - 1.0 / 3.0).abs() < 1e-12);
        assert!((m.mape - 100.0 / 9.0).abs() < 1e-9);
        assert!((m.r2 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_r2_constant_target() {
        let exact = RegressionMetrics::from_pairs(&[2.0, 2.0], &[2.0, 2.0]).unwrap();
        assert_eq!(exact.r2, 1.0);
        let off = RegressionMetrics::from_pairs(&[2.0, 3.0], &[2.0, 2.0]).unwrap();
        assert_eq!(off.r2, 0.0);
    }

    #[test]
    fn test_mape_skips_zero_targets() {
        let m = RegressionMetrics::from_pairs(&[1.0, 2.0], &[0.0, 1.0]).unwrap();
        assert!((m.mape - 100.0).abs() < 1e-12);
        assert!(RegressionMetrics::from_pairs(&[1.0], &[]).is_err());
    }

    #[test]
    fn test_timing_stats() {
        let stats = TimingStats::from_samples(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.total_secs, 10.0);
        assert_eq!(stats.mean_secs, 2.5);
        assert_eq!(stats.median_secs, 2.5);
        assert_eq!(stats.min_secs, 1.0);
        assert_eq!(stats.max_secs, 4.0);
        assert_eq!(stats.p95_secs, 4.0);
        assert!((stats.std_secs - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(3));
        assert_eq!((&clock).now(), Duration::from_millis(3));
    }

    #[test]
    fn test_invalid_config() {
        assert!(Evaluator::new(EvaluatorConfig {
            threshold: 1.5,
            batch_size: 8
        })
        .is_err());
        assert!(EvaluatorConfig {
            threshold: 0.5,
            batch_size: 0
        }
        .validate()
        .is_err());
    }
}
