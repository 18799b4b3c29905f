//! Append-only per-epoch training history.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SurrogateError, SurrogateResult};

/// Schema version of the serialized history.
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

/// Metrics for one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 0-based epoch index
    pub epoch: usize,
    /// Mean training loss over batches
    pub train_loss: f64,
    /// Mean validation loss
    pub val_loss: f64,
    /// Learning rate used for the epoch
    pub learning_rate: f64,
    /// Wall time since training started
    pub wall_time_secs: f64,
    /// Largest gradient norm seen in the epoch
    pub max_grad_norm: f64,
    /// Validation loss per term
    pub val_terms: BTreeMap<String, f64>,
}

impl EpochRecord {
    /// Validation value of one loss term.
    pub fn val_term(&self, name: &str) -> Option<f64> {
        self.val_terms.get(name).copied()
    }

    /// Equality ignoring wall time.
    pub fn same_outcome(&self, other: &Self) -> bool {
        Self {
            wall_time_secs: 0.0,
            ..self.clone()
        } == Self {
            wall_time_secs: 0.0,
            ..other.clone()
        }
    }
}

/// Ordered epoch records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    schema_version: u32,
    records: Vec<EpochRecord>,
}

impl Default for TrainingHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self {
            schema_version: HISTORY_SCHEMA_VERSION,
            records: Vec::new(),
        }
    }

    /// Append a record. Epochs must be consecutive from 0.
    pub fn push(&mut self, record: EpochRecord) -> SurrogateResult<()> {
        let expected = self.records.len();
        if record.epoch != expected {
            return Err(SurrogateError::training(format!(
                "history expects epoch {expected}, got {}",
                record.epoch
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    /// Record with the lowest validation loss.
    pub fn best(&self) -> Option<&EpochRecord> {
        self.records
            .iter()
            .filter(|r| r.val_loss.is_finite())
            .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss))
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.val_loss).collect()
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    /// Validation series of a single loss term.
    pub fn val_term_series(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|r| r.val_term(name))
            .collect()
    }

    /// Equality ignoring wall time.
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.records.len() == other.records.len()
            && self
                .records
                .iter()
                .zip(&other.records)
                .all(|(a, b)| a.same_outcome(b))
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> SurrogateResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a history written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> SurrogateResult<Self> {
        let history: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        if history.schema_version != HISTORY_SCHEMA_VERSION {
            return Err(SurrogateError::checkpoint_mismatch(
                "history.schema_version",
                HISTORY_SCHEMA_VERSION,
                history.schema_version,
            ));
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(epoch: usize, val_loss: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: val_loss * 1.1,
            val_loss,
            learning_rate: 1e-3,
            wall_time_secs: epoch as f64,
            max_grad_norm: 0.5,
            val_terms: [("coupling".to_string(), val_loss / 2.0)].into_iter().collect(),
        }
    }

    #[test]
    fn test_append_only() {
        let mut history = TrainingHistory::new();
        history.push(record(0, 1.0)).unwrap();
        history.push(record(1, 0.5)).unwrap();
        assert!(history.push(record(1, 0.4)).is_err());
        assert!(history.push(record(5, 0.4)).is_err());
        assert_eq!(history.len(), 2);
        assert_eq!(history.best().unwrap().epoch, 1);
        assert_eq!(history.val_term_series("coupling"), vec![0.5, 0.25]);
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("training_history.json");
        let mut history = TrainingHistory::new();
        history.push(record(0, 0.3)).unwrap();
        history.save(&path).unwrap();

        let loaded = TrainingHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_same_outcome_ignores_wall_time() {
        let mut a = TrainingHistory::new();
        let mut b = TrainingHistory::new();
        a.push(record(0, 0.3)).unwrap();
        let mut other = record(0, 0.3);
        other.wall_time_secs = 42.0;
        b.push(other).unwrap();
        assert_ne!(a, b);
        assert!(a.same_outcome(&b));
    }
}
