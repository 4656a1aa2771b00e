//! Early stopping on evaluation loss

/// Early stopping tracker
///
/// Watches the per-epoch evaluation loss and signals a stop after `patience`
/// consecutive epochs without an improvement of at least `min_delta`.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    /// Epochs without improvement before stopping
    patience: usize,
    /// Minimum improvement that counts
    min_delta: f32,
    /// Best evaluation loss observed so far
    best_loss: Option<f32>,
    /// Epochs since the last improvement
    counter: usize,
}

impl EarlyStopping {
    /// Create a new tracker
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: None,
            counter: 0,
        }
    }

    /// Observe an epoch's evaluation loss
    ///
    /// # Returns
    /// `true` if training should stop.
    pub fn observe(&mut self, eval_loss: f32) -> bool {
        match self.best_loss {
            Some(best) if eval_loss < best - self.min_delta => {
                self.best_loss = Some(eval_loss);
                self.counter = 0;
            }
            Some(_) => {
                self.counter += 1;
            }
            None => {
                self.best_loss = Some(eval_loss);
            }
        }

        self.counter >= self.patience
    }

    /// Whether the given loss improves on the best seen so far
    pub fn is_improvement(&self, eval_loss: f32) -> bool {
        match self.best_loss {
            Some(best) => eval_loss < best - self.min_delta,
            None => true,
        }
    }

    /// Best evaluation loss observed so far
    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    /// Epochs since the last improvement
    pub fn counter(&self) -> usize {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience_epochs() {
        let mut stopper = EarlyStopping::new(3, 0.0);

        assert!(!stopper.observe(1.0));
        assert!(!stopper.observe(1.1));
        assert!(!stopper.observe(1.2));
        assert!(stopper.observe(1.3));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut stopper = EarlyStopping::new(2, 0.0);

        assert!(!stopper.observe(1.0));
        assert!(!stopper.observe(1.1));
        assert!(!stopper.observe(0.9)); // improvement, counter back to 0
        assert_eq!(stopper.counter(), 0);
        assert!(!stopper.observe(1.0));
        assert!(stopper.observe(1.0));
    }

    #[test]
    fn test_min_delta_requires_real_improvement() {
        let mut stopper = EarlyStopping::new(2, 0.1);

        assert!(!stopper.observe(1.0));
        // 0.95 is better but not by min_delta, so it counts as stagnation
        assert!(!stopper.observe(0.95));
        assert!(stopper.observe(0.94));
        assert_eq!(stopper.best_loss(), Some(1.0));
    }

    #[test]
    fn test_first_observation_sets_best() {
        let mut stopper = EarlyStopping::new(1, 0.0);
        assert!(stopper.is_improvement(5.0));
        stopper.observe(5.0);
        assert_eq!(stopper.best_loss(), Some(5.0));
        assert!(!stopper.is_improvement(5.0));
        assert!(stopper.is_improvement(4.9));
    }
}
