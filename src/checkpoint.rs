//! Versioned checkpoints in safetensors format.
//!
//! A checkpoint is one `.safetensors` file. Parameters are stored as
//! `model.<name>` and optimizer buffers as `optim.<buffer>.<name>`. The JSON
//! [`CheckpointHeader`] lives in the `__metadata__` entry under `header`.
//!
//! Loading validates the header and every tensor name and shape before any
//! parameter is written, so a rejected checkpoint leaves the model untouched.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::config::SurrogateConfig;
use crate::early_stopping::EarlyStopping;
use crate::error::{SurrogateError, SurrogateResult};
use crate::history::TrainingHistory;
use crate::loss::LossWeights;
use crate::model::SurrogateModel;
use crate::optimizer::{GradientDescent, OptimizerState};
use crate::scheduler::LRScheduler;

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const HEADER_KEY: &str = "header";
const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

/// Metadata stored alongside the tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Format version
    pub schema_version: u32,
    /// Architecture the parameters belong to
    pub architecture: SurrogateConfig,
    /// Loss weights of the run, when built from the standard terms
    pub loss_weights: Option<LossWeights>,
    /// Number of completed epochs
    pub epoch: usize,
    /// Scheduler state
    pub scheduler: LRScheduler,
    /// Early stopping state, if enabled
    pub early_stopping: Option<EarlyStopping>,
    /// Optimizer settings and step count
    pub optimizer: OptimizerState,
    /// Best validation loss so far
    pub best_val_loss: Option<f64>,
    /// History up to `epoch`
    pub history: TrainingHistory,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Write a checkpoint atomically.
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    header: &CheckpointHeader,
    model: &SurrogateModel,
    optimizer: Option<&GradientDescent>,
) -> SurrogateResult<()> {
    let path = path.as_ref();
    let mut tensors: Vec<(String, Tensor)> = model
        .parameters()?
        .into_iter()
        .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
        .collect();
    if let Some(optimizer) = optimizer {
        tensors.extend(
            optimizer
                .buffers()
                .into_iter()
                .map(|(name, tensor)| (format!("{OPTIM_PREFIX}{name}"), tensor)),
        );
    }

    let metadata: HashMap<String, String> =
        [(HEADER_KEY.to_string(), serde_json::to_string(header)?)].into_iter().collect();

    let tmp = temp_path(path);
    safetensors::tensor::serialize_to_file(tensors, &Some(metadata), &tmp)?;
    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), epoch = header.epoch, "wrote checkpoint");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Read only the header of a checkpoint.
pub fn read_header(path: impl AsRef<Path>) -> SurrogateResult<CheckpointHeader> {
    let buffer = fs::read(path)?;
    parse_header(&buffer)
}

fn parse_header(buffer: &[u8]) -> SurrogateResult<CheckpointHeader> {
    let (_, metadata) = SafeTensors::read_metadata(buffer)?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(HEADER_KEY))
        .ok_or_else(|| SurrogateError::checkpoint_mismatch("header", "present", "missing"))?;
    let header: CheckpointHeader = serde_json::from_str(raw)?;
    if header.schema_version != CHECKPOINT_SCHEMA_VERSION {
        return Err(SurrogateError::checkpoint_mismatch(
            "schema_version",
            CHECKPOINT_SCHEMA_VERSION,
            header.schema_version,
        ));
    }
    Ok(header)
}

/// Restore parameters, and optionally optimizer buffers, into existing objects.
///
/// The checkpoint architecture must equal the model's.
pub fn load_checkpoint(
    path: impl AsRef<Path>,
    model: &SurrogateModel,
    optimizer: Option<&mut GradientDescent>,
) -> SurrogateResult<CheckpointHeader> {
    let buffer = fs::read(path.as_ref())?;
    let header = parse_header(&buffer)?;
    if let Some((field, expected, found)) = model.config().first_difference(&header.architecture) {
        return Err(SurrogateError::checkpoint_mismatch(
            format!("architecture.{field}"),
            expected,
            found,
        ));
    }

    let mut tensors = candle_core::safetensors::load_buffer(&buffer, model.device())?;
    let params = model.parameters()?;

    let mut updates = Vec::with_capacity(params.len());
    for (name, var) in &params {
        let key = format!("{MODEL_PREFIX}{name}");
        let tensor = tensors
            .remove(&key)
            .ok_or_else(|| SurrogateError::checkpoint_mismatch(key.clone(), "present", "missing"))?;
        if tensor.dims() != var.dims() {
            return Err(SurrogateError::checkpoint_mismatch(
                key,
                format!("{:?}", var.dims()),
                format!("{:?}", tensor.dims()),
            ));
        }
        updates.push((var, tensor));
    }

    let shapes: HashMap<&str, &[usize]> = params.iter().map(|(n, v)| (n.as_str(), v.dims())).collect();
    let mut buffers = HashMap::new();
    for (key, tensor) in tensors {
        let Some(buffer_name) = key.strip_prefix(OPTIM_PREFIX) else {
            return Err(SurrogateError::checkpoint_mismatch(key, "no such parameter", "present"));
        };
        let param = buffer_name.split_once('.').map(|(_, p)| p).unwrap_or_default();
        match shapes.get(param) {
            Some(dims) if *dims == tensor.dims() => {
                buffers.insert(buffer_name.to_string(), tensor);
            }
            Some(dims) => {
                return Err(SurrogateError::checkpoint_mismatch(
                    key,
                    format!("{dims:?}"),
                    format!("{:?}", tensor.dims()),
                ))
            }
            None => return Err(SurrogateError::checkpoint_mismatch(key, "no such parameter", "present")),
        }
    }

    if let Some(optimizer) = optimizer {
        optimizer.restore(&header.optimizer, buffers)?;
    }
    for (var, tensor) in updates {
        var.set(&tensor)?;
    }
    tracing::info!(epoch = header.epoch, "restored checkpoint");
    Ok(header)
}

/// Build a fresh model from a checkpoint's architecture and load its weights.
pub fn load_model(path: impl AsRef<Path>, device: &Device) -> SurrogateResult<(SurrogateModel, CheckpointHeader)> {
    let header = read_header(path.as_ref())?;
    // overwritten below
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let model = SurrogateModel::new(&header.architecture, device, &mut rng)?;
    let header = load_checkpoint(path, &model, None)?;
    Ok((model, header))
}

/// Keeps `best.safetensors` and `last.safetensors` in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> SurrogateResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join("best.safetensors")
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join("last.safetensors")
    }

    /// Overwrite the last checkpoint.
    pub fn save_last(
        &self,
        header: &CheckpointHeader,
        model: &SurrogateModel,
        optimizer: &GradientDescent,
    ) -> SurrogateResult<()> {
        save_checkpoint(self.last_path(), header, model, Some(optimizer))
    }

    /// Overwrite the best checkpoint.
    pub fn save_best(
        &self,
        header: &CheckpointHeader,
        model: &SurrogateModel,
        optimizer: &GradientDescent,
    ) -> SurrogateResult<()> {
        save_checkpoint(self.best_path(), header, model, Some(optimizer))
    }

    pub fn has_best(&self) -> bool {
        self.best_path().exists()
    }

    pub fn has_last(&self) -> bool {
        self.last_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;
    use crate::scheduler::SchedulerType;
    use tempfile::TempDir;

    fn model(seed: u64, config: &SurrogateConfig) -> SurrogateModel {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        SurrogateModel::new(config, &Device::Cpu, &mut rng).unwrap()
    }

    fn header(config: &SurrogateConfig) -> CheckpointHeader {
        CheckpointHeader {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            architecture: config.clone(),
            loss_weights: Some(LossWeights::default()),
            epoch: 3,
            scheduler: LRScheduler::new(SchedulerType::default()).unwrap(),
            early_stopping: Some(EarlyStopping::new(5, 0.0).unwrap()),
            optimizer: GradientDescent::new(OptimizerConfig::default()).unwrap().state(),
            best_val_loss: Some(0.25),
            history: TrainingHistory::new(),
            created_at: Utc::now(),
        }
    }

    fn flat(model: &SurrogateModel) -> Vec<f32> {
        model
            .parameters()
            .unwrap()
            .iter()
            .flat_map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_roundtrip_restores_parameters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let config = SurrogateConfig::test();
        let source = model(1, &config);
        save_checkpoint(&path, &header(&config), &source, None).unwrap();

        let target = model(2, &config);
        assert_ne!(flat(&source), flat(&target));
        let restored = load_checkpoint(&path, &target, None).unwrap();
        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.best_val_loss, Some(0.25));
        assert_eq!(flat(&source), flat(&target));

        let (loaded, _) = load_model(&path, &Device::Cpu).unwrap();
        assert_eq!(flat(&source), flat(&loaded));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_architecture_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let config = SurrogateConfig::test();
        let source = model(1, &config);
        save_checkpoint(&path, &header(&config), &source, None).unwrap();

        let mut other = config.clone();
        other.embed_dim = 32;
        other.ff_dim = 64;
        let target = model(2, &other);
        let before = flat(&target);
        match load_checkpoint(&path, &target, None) {
            Err(SurrogateError::CheckpointMismatch { field, .. }) => {
                assert!(field.starts_with("architecture."), "{field}");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert_eq!(before, flat(&target));
    }

    #[test]
    fn test_schema_version_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let config = SurrogateConfig::test();
        let mut h = header(&config);
        h.schema_version = 99;
        save_checkpoint(&path, &h, &model(1, &config), None).unwrap();
        assert!(matches!(
            read_header(&path),
            Err(SurrogateError::CheckpointMismatch { .. })
        ));
    }

    #[test]
    fn test_manager_paths() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path().join("ckpts")).unwrap();
        let config = SurrogateConfig::test();
        let m = model(1, &config);
        let opt = GradientDescent::new(OptimizerConfig::default()).unwrap();
        assert!(!manager.has_last());
        manager.save_last(&header(&config), &m, &opt).unwrap();
        assert!(manager.has_last());
        assert!(!manager.has_best());
        manager.save_best(&header(&config), &m, &opt).unwrap();
        assert_eq!(read_header(manager.best_path()).unwrap().epoch, 3);
    }
}
