//! Train on a toy linear flow with a closed-form solution.

use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rg_surrogate_rs::prelude::*;
use rg_surrogate_rs::{EarlyStoppingConfig, OptimizerConfig, SchedulerType, UpdateRule};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Least-squares slope of `values` against their index.
fn slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    num / den
}

#[test]
fn test_linear_flow_training_improves_validation_mse() {
    init_tracing();

    let flow = LinearFlow::new([0.8, 1.2, 0.5], [0.3, 0.6, 0.9]);
    let data = TrajectoryDataset::generate(&flow, 2024, 200, CouplingBounds::uniform(0.1, 2.0), 20).unwrap();
    assert_eq!(data.len(), 200);
    assert_eq!(data.report().unwrap().failure_count(), 0);
    let (train, val) = data.split(0.8, 1).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let model = SurrogateModel::new(&SurrogateConfig::test(), &Device::Cpu, &mut rng).unwrap();
    let loss = CombinedLoss::new(LossWeights::default()).unwrap();
    let config = TrainerConfig {
        epochs: 50,
        batch_size: 16,
        seed: 9,
        scheduler: SchedulerType::Constant { lr: 1e-3 },
        optimizer: OptimizerConfig {
            rule: UpdateRule::adam(),
            weight_decay: 0.0,
            max_grad_norm: Some(1.0),
        },
        early_stopping: Some(EarlyStoppingConfig {
            patience: 10,
            min_delta: 0.0,
        }),
        ..TrainerConfig::default()
    };
    let mut trainer = Trainer::new(model, loss, config).unwrap();

    let state = trainer.train(&train, &val).unwrap();
    assert!(
        matches!(state, TrainerState::Converged { .. } | TrainerState::Stopped { .. }),
        "{state:?}"
    );

    let mse = trainer.history().val_term_series("coupling");
    assert!(mse.len() >= 10);
    let first_ten = &mse[..10];
    assert!(first_ten.iter().all(|v| v.is_finite()));
    assert!(slope(first_ten) <= 0.0, "validation MSE trend is increasing: {first_ten:?}");
    assert!(first_ten[9] < first_ten[0], "{first_ten:?}");

    let report = Evaluator::new(EvaluatorConfig::default())
        .unwrap()
        .evaluate(trainer.model(), &val)
        .unwrap();
    assert_eq!(report.n_samples, val.len());
    assert!(report.aggregate.mse.is_finite());
}

#[test]
fn test_rollout_follows_target_scales() {
    init_tracing();

    let flow = LinearFlow::new([1.0, 1.0, 1.0], [0.5, 0.5, 0.5]);
    let data = TrajectoryDataset::generate(&flow, 3, 8, CouplingBounds::uniform(0.1, 1.0), 10).unwrap();
    let example = data.get(0).unwrap();

    let config = SurrogateConfig::test();
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let model = SurrogateModel::new(&config, &Device::Cpu, &mut rng).unwrap();

    let context = example.context(config.context_len);
    let scales: Vec<f64> = example.trajectory().nodes()[config.context_len..]
        .iter()
        .map(|s| s.scale)
        .collect();
    let rollout = model.rollout(&context, &scales).unwrap();
    assert_eq!(rollout.len(), scales.len());
    for (prediction, scale) in rollout.iter().zip(&scales) {
        assert_eq!(prediction.state.scale, *scale);
        assert!(prediction.state.is_finite());
        assert!((0.0..=1.0).contains(&prediction.fixed_point_probability));
    }
}
