//! Patience-based early stopping on validation loss.

use serde::{Deserialize, Serialize};

use crate::error::{SurrogateError, SurrogateResult};

/// Tracks the best validation loss and counts epochs without improvement.
///
/// The counter resets when a loss beats the best by more than `min_delta` and
/// increments otherwise. Stopping is signalled once it reaches `patience`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    counter: usize,
    stopped: bool,
}

impl EarlyStopping {
    /// Create a new tracker.
    pub fn new(patience: usize, min_delta: f64) -> SurrogateResult<Self> {
        if patience == 0 {
            return Err(SurrogateError::configuration("patience must be at least 1"));
        }
        if !(min_delta >= 0.0 && min_delta.is_finite()) {
            return Err(SurrogateError::configuration(format!(
                "min_delta must be non-negative, got {min_delta}"
            )));
        }
        Ok(Self {
            patience,
            min_delta,
            best: None,
            counter: 0,
            stopped: false,
        })
    }

    /// Record a validation loss, returning whether training should stop.
    pub fn step(&mut self, loss: f64) -> bool {
        match self.best {
            Some(best) if !(loss < best - self.min_delta) => self.counter += 1,
            _ => {
                self.best = Some(loss);
                self.counter = 0;
            }
        }
        if self.counter >= self.patience {
            self.stopped = true;
        }
        self.stopped
    }

    /// Whether the last call to [`step`](Self::step) had a strict improvement.
    pub fn improved(&self) -> bool {
        self.best.is_some() && self.counter == 0
    }

    /// Best loss seen so far.
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Epochs since the last improvement.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Epochs without improvement that trigger a stop.
    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Whether a stop has been signalled; stays set once reached.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_at_patience_index() {
        let patience = 3;
        let mut es = EarlyStopping::new(patience, 0.0).unwrap();
        // non-improving sequence of length patience + 1
        let losses = [1.0, 1.0, 1.2, 1.1];
        let flags: Vec<bool> = losses.iter().map(|&l| es.step(l)).collect();
        assert_eq!(flags, vec![false, false, false, true]);
        assert_eq!(flags.iter().position(|&f| f), Some(patience));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut es = EarlyStopping::new(2, 0.01).unwrap();
        assert!(!es.step(1.0));
        assert!(!es.step(0.995)); // within min_delta
        assert_eq!(es.counter(), 1);
        assert!(!es.step(0.9));
        assert_eq!(es.counter(), 0);
        assert!(es.improved());
        assert_eq!(es.best(), Some(0.9));
    }

    #[test]
    fn test_best_never_increases() {
        let mut es = EarlyStopping::new(10, 0.0).unwrap();
        let mut previous = f64::INFINITY;
        for loss in [0.5, 0.7, 0.4, 0.45, 0.39, 1.0] {
            es.step(loss);
            let best = es.best().unwrap();
            assert!(best <= previous);
            previous = best;
        }
    }

    #[test]
    fn test_nan_counts_as_no_improvement() {
        let mut es = EarlyStopping::new(1, 0.0).unwrap();
        es.step(1.0);
        assert!(es.step(f64::NAN));
    }

    #[test]
    fn test_invalid() {
        assert!(EarlyStopping::new(0, 0.0).is_err());
        assert!(EarlyStopping::new(2, -1.0).is_err());
    }
}
