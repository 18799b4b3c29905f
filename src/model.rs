//! The surrogate model: one graph encoder and one resonance decoder sharing a
//! parameter store.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::SurrogateConfig;
use crate::data::{decoder_token, EncoderInput, SurrogateBatch, TrainingExample};
use crate::decoder::{DecoderOutput, ResonanceDecoder};
use crate::encoder::{EncoderOutput, GraphEncoder};
use crate::error::{SurrogateError, SurrogateResult};
use crate::state::{CouplingState, HolographicState, NODE_FEATURES};

/// Probability above which a prediction counts as a fixed point.
pub const FIXED_POINT_THRESHOLD: f64 = 0.5;

/// Prediction for one target scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted coupling state at the target scale
    pub state: CouplingState,
    /// Probability that the state is a fixed point
    pub fixed_point_probability: f64,
    /// Predicted effective action
    pub action: f64,
}

impl Prediction {
    /// Whether the fixed-point probability exceeds `threshold`.
    pub fn is_fixed_point(&self, threshold: f64) -> bool {
        self.fixed_point_probability > threshold
    }
}

/// Encoder-decoder surrogate with exclusively owned parameters.
pub struct SurrogateModel {
    config: SurrogateConfig,
    encoder: GraphEncoder,
    decoder: ResonanceDecoder,
    var_map: VarMap,
    device: Device,
}

impl std::fmt::Debug for SurrogateModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateModel")
            .field("config", &self.config)
            .field("parameters", &self.parameter_count())
            .finish()
    }
}

impl SurrogateModel {
    /// Build a model and initialize every parameter from `rng`.
    pub fn new<R: Rng>(config: &SurrogateConfig, device: &Device, rng: &mut R) -> SurrogateResult<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let encoder = GraphEncoder::new(config, vb.pp("encoder"), device)?;
        let decoder = ResonanceDecoder::new(config, vb.pp("decoder"))?;

        let model = Self {
            config: config.clone(),
            encoder,
            decoder,
            var_map,
            device: device.clone(),
        };
        model.initialize(rng)?;
        tracing::debug!(parameters = model.parameter_count(), "built surrogate model");
        Ok(model)
    }

    /// Overwrite parameters in name order: N(0, 1/fan_in) weights, zero
    /// biases, norms left at unit gain and zero shift.
    fn initialize<R: Rng>(&self, rng: &mut R) -> SurrogateResult<()> {
        for (name, var) in self.parameters()? {
            if name.contains("norm") {
                continue;
            }
            let dims = var.dims().to_vec();
            let count: usize = dims.iter().product();
            let values: Vec<f32> = if dims.len() >= 2 {
                let std = (1.0 / dims[1] as f32).sqrt();
                let normal = Normal::new(0.0f32, std)
                    .map_err(|e| SurrogateError::configuration(e.to_string()))?;
                (0..count).map(|_| normal.sample(rng)).collect()
            } else {
                vec![0.0; count]
            };
            var.set(&Tensor::from_vec(values, dims.as_slice(), &self.device)?)?;
        }
        Ok(())
    }

    /// Architecture and task configuration.
    pub fn config(&self) -> &SurrogateConfig {
        &self.config
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// The encoder.
    pub fn encoder(&self) -> &GraphEncoder {
        &self.encoder
    }

    /// All parameters sorted by name.
    pub fn parameters(&self) -> SurrogateResult<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| SurrogateError::training("parameter store lock poisoned"))?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Encode and decode a padded batch.
    pub fn forward_parts(&self, input: &EncoderInput, tokens: &Tensor) -> SurrogateResult<(EncoderOutput, DecoderOutput)> {
        let encoded = self.encoder.forward(input)?;
        let decoded = self
            .decoder
            .forward(tokens, &encoded.hidden, &encoded.key_bias)?;
        Ok((encoded, decoded))
    }

    /// Teacher-forced forward pass over a collated batch.
    pub fn forward(&self, batch: &SurrogateBatch) -> SurrogateResult<DecoderOutput> {
        Ok(self.forward_parts(&batch.encoder, &batch.tokens)?.1)
    }

    /// Encode one trajectory into an (N, D) matrix.
    pub fn encode(&self, state: &HolographicState) -> SurrogateResult<Tensor> {
        Ok(self.encoder.encode(state)?)
    }

    /// Predict the state at `target_scale` in a single decoder step.
    pub fn predict_terminal(&self, state: &HolographicState, target_scale: f64) -> SurrogateResult<Prediction> {
        let mut predictions = self.predict_batch(&[(state, target_scale)])?;
        predictions
            .pop()
            .ok_or_else(|| SurrogateError::training("empty prediction batch"))
    }

    /// Single-step predictions for many independent trajectories.
    pub fn predict_batch(&self, requests: &[(&HolographicState, f64)]) -> SurrogateResult<Vec<Prediction>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let states: Vec<&HolographicState> = requests.iter().map(|(s, _)| *s).collect();
        let input = EncoderInput::from_states(&states, &self.device)?;
        let tokens: Vec<f32> = requests
            .iter()
            .flat_map(|(state, scale)| decoder_token(state.current(), *scale))
            .collect();
        let tokens = Tensor::from_vec(tokens, (requests.len(), 1, NODE_FEATURES), &self.device)?;

        let (_, output) = self.forward_parts(&input, &tokens)?;
        let scales: Vec<f64> = requests.iter().map(|(_, scale)| *scale).collect();
        read_final_predictions(&output, &scales)
    }

    /// Terminal predictions for examples, using their configured context.
    pub fn predict_examples(&self, examples: &[&TrainingExample]) -> SurrogateResult<Vec<Prediction>> {
        let contexts: Vec<HolographicState> = examples
            .iter()
            .map(|e| e.context(self.config.context_len))
            .collect();
        let requests: Vec<(&HolographicState, f64)> = contexts
            .iter()
            .zip(examples)
            .map(|(context, example)| (context, example.terminal().scale))
            .collect();
        self.predict_batch(&requests)
    }

    /// Autoregressive rollout through `target_scales`, feeding each predicted
    /// state back as the next decoder input.
    pub fn rollout(&self, state: &HolographicState, target_scales: &[f64]) -> SurrogateResult<Vec<Prediction>> {
        if target_scales.len() > self.config.max_len {
            return Err(SurrogateError::configuration(format!(
                "rollout of {} steps exceeds max_len {}",
                target_scales.len(),
                self.config.max_len
            )));
        }
        let input = EncoderInput::from_states(&[state], &self.device)?;
        let encoded = self.encoder.forward(&input)?;

        let mut tokens: Vec<f32> = Vec::with_capacity(target_scales.len() * NODE_FEATURES);
        let mut from = *state.current();
        let mut predictions = Vec::with_capacity(target_scales.len());
        for (step, &scale) in target_scales.iter().enumerate() {
            tokens.extend_from_slice(&decoder_token(&from, scale));
            let token_tensor =
                Tensor::from_slice(&tokens, (1, step + 1, NODE_FEATURES), &self.device)?;
            let output = self
                .decoder
                .forward(&token_tensor, &encoded.hidden, &encoded.key_bias)?;
            let prediction = read_final_predictions(&output, &[scale])?
                .pop()
                .ok_or_else(|| SurrogateError::training("empty rollout step"))?;
            from = prediction.state;
            predictions.push(prediction);
        }
        Ok(predictions)
    }

    /// Predicted fixed point at `target_scale`, if the head is confident.
    pub fn predict_fixed_point(
        &self,
        state: &HolographicState,
        target_scale: f64,
    ) -> SurrogateResult<Option<CouplingState>> {
        let prediction = self.predict_terminal(state, target_scale)?;
        Ok(prediction
            .is_fixed_point(FIXED_POINT_THRESHOLD)
            .then_some(prediction.state))
    }

    /// Predicted action at `target_scale`.
    pub fn predict_action(&self, state: &HolographicState, target_scale: f64) -> SurrogateResult<f64> {
        Ok(self.predict_terminal(state, target_scale)?.action)
    }
}

fn read_final_predictions(output: &DecoderOutput, scales: &[f64]) -> SurrogateResult<Vec<Prediction>> {
    let couplings: Vec<Vec<f32>> = output.final_couplings()?.to_vec2()?;
    let logits: Vec<Vec<f32>> = output.final_fixed_point_logit()?.to_vec2()?;
    let actions: Vec<Vec<f32>> = output.final_action()?.to_vec2()?;

    Ok(couplings
        .iter()
        .zip(&logits)
        .zip(&actions)
        .zip(scales)
        .map(|(((c, logit), action), &scale)| Prediction {
            state: CouplingState::new(c[0] as f64, c[1] as f64, c[2] as f64, scale),
            fixed_point_probability: 1.0 / (1.0 + (-(logit[0] as f64)).exp()),
            action: action[0] as f64,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model(seed: u64) -> SurrogateModel {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        SurrogateModel::new(&SurrogateConfig::test(), &Device::Cpu, &mut rng).unwrap()
    }

    fn trajectory() -> HolographicState {
        HolographicState::from_states(
            (0..4)
                .map(|i| {
                    let t = i as f64 * 0.1;
                    CouplingState::new(1.0 - t, 0.8, 0.5 + t, (-t).exp())
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_initialization_is_seeded() {
        let a = model(1);
        let b = model(1);
        let c = model(2);
        let flat = |m: &SurrogateModel| -> Vec<f32> {
            m.parameters()
                .unwrap()
                .into_iter()
                .flat_map(|(_, v)| v.flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect()
        };
        assert_eq!(flat(&a), flat(&b));
        assert_ne!(flat(&a), flat(&c));
        assert!(a.parameter_count() > 0);
    }

    #[test]
    fn test_norms_and_biases_initialized() {
        let m = model(3);
        for (name, var) in m.parameters().unwrap() {
            let values: Vec<f32> = var.flatten_all().unwrap().to_vec1().unwrap();
            if name.ends_with("norm.weight") {
                assert!(values.iter().all(|&v| v == 1.0), "{name}");
            } else if name.ends_with(".bias") {
                assert!(values.iter().all(|&v| v == 0.0), "{name}");
            }
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SurrogateConfig::test();
        config.num_decoder_heads = 5;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            SurrogateModel::new(&config, &Device::Cpu, &mut rng),
            Err(SurrogateError::Configuration(_))
        ));
    }

    #[test]
    fn test_prediction_modes() {
        let m = model(4);
        let state = trajectory();

        let single = m.predict_terminal(&state, 0.3).unwrap();
        assert_eq!(single.state.scale, 0.3);
        assert!(single.state.is_finite());
        assert!((0.0..=1.0).contains(&single.fixed_point_probability));

        let batch = m.predict_batch(&[(&state, 0.3), (&state.prefix(2), 0.5)]).unwrap();
        assert_eq!(batch.len(), 2);
        assert!((batch[0].state.lambda - single.state.lambda).abs() < 1e-5);

        let rollout = m.rollout(&state, &[0.6, 0.5, 0.4]).unwrap();
        assert_eq!(rollout.len(), 3);
        assert_eq!(rollout[2].state.scale, 0.4);

        // the first rollout step is a single-step prediction
        let first = m.predict_terminal(&state, 0.6).unwrap();
        assert!((rollout[0].state.mu - first.state.mu).abs() < 1e-5);

        assert!(m.predict_action(&state, 0.3).unwrap().is_finite());
        let _ = m.predict_fixed_point(&state, 0.3).unwrap();
    }

    #[test]
    fn test_encode_shape() {
        let m = model(5);
        let encoded = m.encode(&trajectory()).unwrap();
        assert_eq!(encoded.dims(), &[4, m.config().embed_dim]);
    }
}
