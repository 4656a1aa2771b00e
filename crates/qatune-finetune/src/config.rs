//! Training configuration structures for fine-tuning
//!
//! Hyperparameters load from a JSON file; anything not supplied falls back
//! to the defaults below.

use std::path::Path;

use anyhow::{Context, Result};
use qatune_model::Seq2SeqConfig;
use serde::{Deserialize, Serialize};

/// Complete training configuration loaded from file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigFile {
    /// Model configuration
    pub model: Seq2SeqConfig,
    /// Training hyperparameters
    pub training: TrainingHyperparams,
    /// Optimizer configuration
    pub optimizer: OptimizerHyperparams,
}

/// Training hyperparameters
///
/// Defines the epoch-driven fine-tuning loop parameters including batch
/// size, gradient accumulation, checkpointing and early stopping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHyperparams {
    /// Batch size per device
    pub batch_size: usize,
    /// Maximum number of epochs
    pub num_epochs: usize,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Checkpoint save interval in optimizer steps
    pub save_steps: usize,
    /// Maximum number of rolling checkpoints to keep
    pub save_total_limit: usize,
    /// Logging interval (optimizer steps)
    pub log_interval: usize,
    /// Epochs without eval-loss improvement before stopping
    pub early_stopping_patience: usize,
    /// Minimum eval-loss improvement that resets the patience counter
    pub early_stopping_min_delta: f32,
    /// Fraction of the dataset held out for evaluation
    pub eval_fraction: f32,
    /// Number of data loading workers (accepted for config compatibility;
    /// loading is currently single-threaded)
    pub num_workers: usize,
    /// Restore the best checkpoint by eval loss after training
    pub load_best_model_at_end: bool,
    /// Number of trailing decoder blocks left trainable
    pub trainable_decoder_blocks: usize,
    /// Random seed for shuffling and initialization (None = non-deterministic)
    pub seed: Option<u64>,
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerHyperparams {
    /// Learning rate
    pub learning_rate: f32,
    /// Weight decay
    pub weight_decay: f32,
    /// AdamW beta1
    pub beta1: f32,
    /// AdamW beta2
    pub beta2: f32,
    /// AdamW epsilon
    pub eps: f32,
}

impl TrainingConfigFile {
    /// Load configuration from JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: TrainingConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Create default configuration
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            model: Seq2SeqConfig::default(),
            training: TrainingHyperparams {
                batch_size: 2,
                num_epochs: 50,
                gradient_accumulation_steps: 4,
                save_steps: 500,
                save_total_limit: 4,
                log_interval: 10,
                early_stopping_patience: 3,
                early_stopping_min_delta: 0.0,
                eval_fraction: 0.2,
                num_workers: 4,
                load_best_model_at_end: true,
                trainable_decoder_blocks: 6,
                seed: None,
            },
            optimizer: OptimizerHyperparams {
                learning_rate: 1e-6,
                weight_decay: 0.001,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = TrainingConfigFile::default();
        assert_eq!(config.training.batch_size, 2);
        assert_eq!(config.training.num_epochs, 50);
        assert_eq!(config.training.gradient_accumulation_steps, 4);
        assert_eq!(config.training.save_steps, 500);
        assert_eq!(config.training.save_total_limit, 4);
        assert_eq!(config.training.early_stopping_patience, 3);
        assert_eq!(config.training.trainable_decoder_blocks, 6);
        assert_eq!(config.optimizer.learning_rate, 1e-6);
        assert_eq!(config.optimizer.weight_decay, 0.001);
    }

    #[test]
    fn test_config_from_file() {
        let config_json = r#"{
            "model": {
                "vocab_size": 1000,
                "n_encoder_layer": 2,
                "n_decoder_layer": 2,
                "n_head": 2,
                "n_embd": 64,
                "max_source_len": 128,
                "max_target_len": 32,
                "pad_token_id": 1,
                "eos_token_id": 2,
                "decoder_start_token_id": 2,
                "dropout": null,
                "seed": 7
            },
            "training": {
                "batch_size": 4,
                "num_epochs": 10,
                "gradient_accumulation_steps": 2,
                "save_steps": 100,
                "save_total_limit": 2,
                "log_interval": 5,
                "early_stopping_patience": 2,
                "early_stopping_min_delta": 0.01,
                "eval_fraction": 0.1,
                "num_workers": 1,
                "load_best_model_at_end": false,
                "trainable_decoder_blocks": 1,
                "seed": 7
            },
            "optimizer": {
                "learning_rate": 0.0001,
                "weight_decay": 0.01,
                "beta1": 0.9,
                "beta2": 0.98,
                "eps": 1e-7
            }
        }"#;

        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(config_json.as_bytes())
            .expect("Failed to write config");
        file.flush().expect("Failed to flush");

        let config = TrainingConfigFile::from_file(file.path()).expect("Failed to load config");

        assert_eq!(config.model.vocab_size, 1000);
        assert_eq!(config.model.max_target_len, 32);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.eval_fraction, 0.1);
        assert_eq!(config.optimizer.learning_rate, 0.0001);
    }
}
