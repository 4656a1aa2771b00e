//! Checkpoint save/load functionality
//!
//! A checkpoint is a SafeTensors weights file plus a JSON metadata sidecar
//! carrying the model configuration, format version and training state.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use aprender::nn::serialize::{load_model, save_model};
use serde::{Deserialize, Serialize};

use crate::config::Seq2SeqConfig;
use crate::seq2seq::Seq2Seq;

/// Checkpoint metadata containing training information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Global optimizer step number
    pub step: usize,
    /// Epoch the checkpoint was taken in
    pub epoch: Option<usize>,
    /// Training loss at this checkpoint
    pub loss: Option<f32>,
    /// Evaluation loss at this checkpoint
    pub eval_loss: Option<f32>,
    /// Learning rate at this checkpoint
    pub learning_rate: Option<f32>,
    /// Additional metadata as key-value pairs
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self {
            step: 0,
            epoch: None,
            loss: None,
            eval_loss: None,
            learning_rate: None,
            extra: HashMap::new(),
        }
    }
}

/// Checkpoint format version for compatibility checking
const CHECKPOINT_VERSION: &str = "1.0.0";

/// Save a model checkpoint to disk
///
/// Writes `<path>.safetensors` (weights) and `<path>.json` (metadata).
///
/// # Errors
/// Returns an error if the directory cannot be created, weights cannot be
/// serialized, or the metadata file cannot be written.
pub fn save_checkpoint<P: AsRef<Path>>(
    model: &Seq2Seq,
    path: P,
    metadata: Option<CheckpointMetadata>,
) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create checkpoint directory: {}", parent.display())
        })?;
    }

    let weights_path = path.with_extension("safetensors");
    save_model(model, &weights_path)
        .map_err(|e| anyhow::anyhow!("Failed to save weights to SafeTensors: {}", e))?;

    let metadata_path = path.with_extension("json");
    let metadata = metadata.unwrap_or_default();
    let metadata_data = CheckpointMetadata {
        extra: {
            let mut extra = HashMap::new();
            extra.insert(
                "version".to_string(),
                serde_json::Value::String(CHECKPOINT_VERSION.to_string()),
            );
            extra.insert("config".to_string(), serde_json::to_value(model.config())?);
            extra.extend(metadata.extra.clone());
            extra
        },
        ..metadata
    };
    let json_data = serde_json::to_string_pretty(&metadata_data)
        .context("Failed to serialize metadata to JSON")?;
    fs::write(&metadata_path, json_data)
        .with_context(|| format!("Failed to write metadata file: {}", metadata_path.display()))?;

    Ok(())
}

/// Load a model checkpoint from disk
///
/// # Returns
/// Tuple of (model, metadata). The model comes back fully trainable; callers
/// reapply their freeze policy.
///
/// # Errors
/// Returns an error if either file cannot be read, the version does not
/// match, or the weights fail to deserialize.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<(Seq2Seq, CheckpointMetadata)> {
    let path = path.as_ref();

    let metadata_path = path.with_extension("json");
    let json_data = fs::read_to_string(&metadata_path)
        .with_context(|| format!("Failed to read metadata file: {}", metadata_path.display()))?;

    let metadata: CheckpointMetadata =
        serde_json::from_str(&json_data).context("Failed to parse metadata JSON")?;

    let config_value = metadata
        .extra
        .get("config")
        .ok_or_else(|| anyhow::anyhow!("Missing config in metadata"))?;
    let config: Seq2SeqConfig = serde_json::from_value(config_value.clone())
        .context("Failed to parse config from metadata")?;

    let version = metadata
        .extra
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing version in metadata"))?;
    if version != CHECKPOINT_VERSION {
        anyhow::bail!(
            "Checkpoint version mismatch: expected {}, got {}",
            CHECKPOINT_VERSION,
            version
        );
    }

    let mut model = Seq2Seq::new(config);

    let weights_path = path.with_extension("safetensors");
    load_model(&mut model, &weights_path)
        .map_err(|e| anyhow::anyhow!("Failed to load weights from SafeTensors: {}", e))?;

    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_checkpoint_creates_files() {
        let model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();

        assert!(checkpoint_path.with_extension("json").exists());
        assert!(checkpoint_path.with_extension("safetensors").exists());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        let metadata = CheckpointMetadata {
            step: 42,
            epoch: Some(3),
            loss: Some(2.5),
            eval_loss: Some(2.7),
            learning_rate: Some(1e-6),
            extra: HashMap::new(),
        };

        save_checkpoint(&model, &checkpoint_path, Some(metadata.clone())).unwrap();

        let (loaded_model, loaded_metadata) = load_checkpoint(&checkpoint_path).unwrap();
        assert_eq!(loaded_model.config(), model.config());
        assert_eq!(loaded_metadata.step, metadata.step);
        assert_eq!(loaded_metadata.epoch, metadata.epoch);
        assert_eq!(loaded_metadata.loss, metadata.loss);
        assert_eq!(loaded_metadata.eval_loss, metadata.eval_loss);
        assert_eq!(loaded_metadata.learning_rate, metadata.learning_rate);
    }

    #[test]
    fn test_corrupted_weights_fail_to_load() {
        let model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();
        assert!(load_checkpoint(&checkpoint_path).is_ok());

        let safetensors_path = checkpoint_path.with_extension("safetensors");
        fs::write(&safetensors_path, b"corrupted").unwrap();
        assert!(load_checkpoint(&checkpoint_path).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();

        let metadata_path = checkpoint_path.with_extension("json");
        let json = fs::read_to_string(&metadata_path).unwrap();
        let patched = json.replace(CHECKPOINT_VERSION, "0.0.1");
        fs::write(&metadata_path, patched).unwrap();

        assert!(load_checkpoint(&checkpoint_path).is_err());
    }
}
