//! AdamW optimizer and learning rate scheduling for fine-tuning
//!
//! The optimizer consumes the explicit gradient buffers
//! `Seq2Seq::forward_backward` produces, keyed by dotted parameter name.
//! First and second moment estimates live here under the same names, so
//! frozen parameters (which are never handed to `step`) carry no state.

use std::collections::BTreeMap;

use anyhow::Result;
use aprender::autograd::Tensor;
use qatune_model::{Gradients, Seq2Seq};

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f32,
    /// Weight decay
    pub weight_decay: f32,
    /// Beta1 for AdamW
    pub beta1: f32,
    /// Beta2 for AdamW
    pub beta2: f32,
    /// Epsilon for AdamW
    pub eps: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-6,
            weight_decay: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// AdamW with decoupled weight decay over named parameters
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    /// Step counter for bias correction
    t: u64,
    /// First moment estimates keyed by parameter name
    m: BTreeMap<String, Vec<f32>>,
    /// Second moment estimates keyed by parameter name
    v: BTreeMap<String, Vec<f32>>,
}

impl AdamW {
    /// Create an optimizer with empty moment state
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            t: 0,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
        }
    }

    /// Apply one update to every parameter that has a gradient
    ///
    /// Parameters without a matching gradient buffer are left untouched.
    /// Weight decay is decoupled: theta = (1 - lr * wd) * theta - lr_t * m_hat / (sqrt(v_hat) + eps),
    /// with the bias correction folded into lr_t.
    pub fn step(&mut self, params: Vec<(String, &mut Tensor)>, grads: &Gradients) {
        self.t += 1;
        let bias_correction =
            (1.0 - self.beta2.powi(self.t as i32)).sqrt() / (1.0 - self.beta1.powi(self.t as i32));
        let lr_t = self.lr * bias_correction;
        let decay = 1.0 - self.lr * self.weight_decay;

        for (name, param) in params {
            let Some(grad) = grads.get(&name) else {
                continue;
            };

            let m = self
                .m
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let v = self
                .v
                .entry(name)
                .or_insert_with(|| vec![0.0; grad.len()]);

            let data = param.data();
            let mut updated = Vec::with_capacity(data.len());
            for i in 0..data.len() {
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * grad[i];
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * grad[i] * grad[i];
                updated.push(data[i] * decay - lr_t * m[i] / (v[i].sqrt() + self.eps));
            }

            let shape = param.shape().to_vec();
            *param = Tensor::new(&updated, &shape);
        }
    }

    /// Current learning rate
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Override the learning rate (used by the decay schedule)
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Setup the optimizer for a model's trainable parameters
///
/// Frozen parameters are simply never handed to `step`, so they receive no
/// updates. The freeze policy must already be applied.
///
/// # Errors
/// Returns an error if no parameters are trainable.
pub fn setup_optimizer(model: &mut Seq2Seq, config: &OptimizerConfig) -> Result<AdamW> {
    if model.trainable_named_parameters_mut().is_empty() {
        anyhow::bail!("Model has no trainable parameters to optimize");
    }
    Ok(AdamW::new(config))
}

/// Linear decay multiplier for a given optimizer step
///
/// Decays from 1.0 at step 0 to 0.0 at `total_steps`.
pub fn get_lr_multiplier(step: usize, total_steps: usize) -> f32 {
    if total_steps == 0 || step >= total_steps {
        return 0.0;
    }
    1.0 - step as f32 / total_steps as f32
}

/// Apply the linearly decayed learning rate for the current step
pub fn update_learning_rate(
    optimizer: &mut AdamW,
    step: usize,
    total_steps: usize,
    base_lr: f32,
) {
    optimizer.set_lr(base_lr * get_lr_multiplier(step, total_steps));
}

/// Get current learning rate from optimizer
pub fn get_learning_rate(optimizer: &AdamW) -> f32 {
    optimizer.lr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qatune_model::{apply_freeze_policy, Seq2SeqConfig};

    #[test]
    fn test_lr_multiplier_linear_decay() {
        assert_eq!(get_lr_multiplier(0, 100), 1.0);
        assert!((get_lr_multiplier(50, 100) - 0.5).abs() < 1e-6);
        assert_eq!(get_lr_multiplier(100, 100), 0.0);
        assert_eq!(get_lr_multiplier(150, 100), 0.0);
    }

    #[test]
    fn test_lr_multiplier_zero_total() {
        assert_eq!(get_lr_multiplier(0, 0), 0.0);
    }

    #[test]
    fn test_setup_over_trainable_subset() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());
        apply_freeze_policy(&mut model, 1).expect("freeze");

        let optimizer = setup_optimizer(&mut model, &OptimizerConfig::default())
            .expect("setup failed");
        assert_eq!(get_learning_rate(&optimizer), 1e-6);
    }

    #[test]
    fn test_setup_fails_with_everything_frozen() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());
        model.freeze_all();
        assert!(setup_optimizer(&mut model, &OptimizerConfig::default()).is_err());
    }

    #[test]
    fn test_update_learning_rate() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let mut optimizer =
            setup_optimizer(&mut model, &OptimizerConfig::default()).expect("setup");

        update_learning_rate(&mut optimizer, 25, 100, 1e-6);
        assert!((get_learning_rate(&optimizer) - 0.75e-6).abs() < 1e-12);
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut optimizer = AdamW::new(&config);

        let mut param = Tensor::new(&[1.0, -1.0], &[2]);
        let mut grads = Gradients::new();
        grads.accumulate("w", vec![1.0, -1.0]);

        optimizer.step(vec![("w".to_string(), &mut param)], &grads);
        // Positive gradient lowers the weight, negative raises it
        assert!(param.data()[0] < 1.0);
        assert!(param.data()[1] > -1.0);
    }

    #[test]
    fn test_step_skips_parameters_without_gradients() {
        let mut optimizer = AdamW::new(&OptimizerConfig::default());

        let mut param = Tensor::new(&[1.0], &[1]);
        let grads = Gradients::new();

        optimizer.step(vec![("w".to_string(), &mut param)], &grads);
        assert_eq!(param.data(), &[1.0]);
    }

    #[test]
    fn test_weight_decay_shrinks_weights() {
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            ..OptimizerConfig::default()
        };
        let mut optimizer = AdamW::new(&config);

        // Zero gradient isolates the decay term
        let mut param = Tensor::new(&[2.0], &[1]);
        let mut grads = Gradients::new();
        grads.accumulate("w", vec![0.0]);

        optimizer.step(vec![("w".to_string(), &mut param)], &grads);
        assert!((param.data()[0] - 2.0 * (1.0 - 0.1 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_steps_converge_toward_minimum() {
        // Minimize (w - 3)^2 by feeding its gradient 2 * (w - 3)
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut optimizer = AdamW::new(&config);
        let mut param = Tensor::new(&[0.0], &[1]);

        for _ in 0..200 {
            let w = param.data()[0];
            let mut grads = Gradients::new();
            grads.accumulate("w", vec![2.0 * (w - 3.0)]);
            optimizer.step(vec![("w".to_string(), &mut param)], &grads);
        }

        assert!((param.data()[0] - 3.0).abs() < 0.5);
    }
}
