//! Training metrics logging

/// Training metrics for a single optimizer step
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    /// Loss value
    pub loss: f32,
    /// Learning rate
    pub learning_rate: f32,
    /// Epoch number
    pub epoch: usize,
    /// Optimizer step number
    pub step: usize,
}

/// Metrics logger for training
pub struct MetricsLogger {
    log_interval: usize,
    step: usize,
    quiet: bool,
}

impl MetricsLogger {
    /// Create a new metrics logger
    pub fn new(log_interval: usize, quiet: bool) -> Self {
        Self {
            log_interval: log_interval.max(1),
            step: 0,
            quiet,
        }
    }

    /// Log metrics for an optimizer step
    pub fn log_step(&mut self, epoch: usize, loss: f32, learning_rate: f32) {
        self.step += 1;

        if self.quiet || !self.step.is_multiple_of(self.log_interval) {
            return;
        }

        let metrics = TrainingMetrics {
            loss,
            learning_rate,
            epoch,
            step: self.step,
        };
        self.print_metrics(&metrics);
    }

    /// Log the evaluation loss at the end of an epoch
    pub fn log_eval(&self, epoch: usize, eval_loss: f32) {
        if !self.quiet {
            println!("Epoch {}: eval_loss={:.6}", epoch, eval_loss);
        }
    }

    /// Print metrics to stdout
    fn print_metrics(&self, metrics: &TrainingMetrics) {
        println!(
            "Epoch {} step {}: loss={:.6}, lr={:.2e}",
            metrics.epoch, metrics.step, metrics.loss, metrics.learning_rate
        );
    }

    /// Get current step number
    pub fn step(&self) -> usize {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counts_even_when_quiet() {
        let mut logger = MetricsLogger::new(10, true);

        logger.log_step(0, 1.5, 1e-6);
        logger.log_step(0, 1.5, 1e-6);
        assert_eq!(logger.step(), 2);
    }

    #[test]
    fn test_zero_interval_clamped() {
        let logger = MetricsLogger::new(0, false);
        assert_eq!(logger.step(), 0);
    }
}
