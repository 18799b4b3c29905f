//! Autodiff gradients agree with central differences across the network.

use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rg_surrogate_rs::gradcheck::check_gradients;
use rg_surrogate_rs::prelude::*;
use rg_surrogate_rs::{SurrogateBatch, TrainingExample};

fn setup(weights: LossWeights, horizon: usize) -> (SurrogateModel, CombinedLoss, SurrogateBatch) {
    let config = SurrogateConfig::test().with_horizon(horizon);
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let model = SurrogateModel::new(&config, &Device::Cpu, &mut rng).unwrap();
    let loss = CombinedLoss::new(weights).unwrap();

    let flow = LinearFlow::new([0.9, 1.1, 0.7], [0.5, 0.3, 0.4]);
    let data = TrajectoryDataset::generate(&flow, 21, 6, CouplingBounds::uniform(0.5, 1.5), 12).unwrap();
    let examples: Vec<&TrainingExample> = data.examples().iter().collect();
    let batch = SurrogateBatch::collate(&examples, &config, &Device::Cpu).unwrap();
    (model, loss, batch)
}

fn assert_agree(model: &SurrogateModel, loss: &CombinedLoss, batch: &SurrogateBatch, filter: &str) {
    let checks = check_gradients(model, loss, batch, filter, 3, 1e-3).unwrap();
    assert!(!checks.is_empty(), "no parameters match {filter}");
    for check in checks {
        let close = (check.analytic - check.numeric).abs() < 2e-3 || check.relative_error(1e-3) < 5e-2;
        assert!(
            close,
            "{}[{}]: analytic {} vs numeric {}",
            check.parameter, check.index, check.analytic, check.numeric
        );
    }
}

#[test]
fn test_encoder_attention_gradients() {
    let (model, loss, batch) = setup(LossWeights::default(), 1);
    assert_agree(&model, &loss, &batch, "encoder.layers.0.attention");
    assert_agree(&model, &loss, &batch, "encoder.output");
}

#[test]
fn test_decoder_gradients() {
    let (model, loss, batch) = setup(LossWeights::default(), 1);
    assert_agree(&model, &loss, &batch, "decoder.layers.0.cross_attn");
    assert_agree(&model, &loss, &batch, "decoder.coupling_head");
}

#[test]
fn test_rollout_loss_gradients() {
    let (model, loss, batch) = setup(LossWeights::for_rollout(), 3);
    assert_agree(&model, &loss, &batch, "decoder.layers.0.self_attn");
    assert_agree(&model, &loss, &batch, "decoder.token_embed");
}
