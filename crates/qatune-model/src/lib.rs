//! Encoder-decoder transformer for question-answer fine-tuning
//!
//! This crate provides the model side of qatune:
//! - Multi-head self- and cross-attention with padding masks
//! - Feed-forward layers with ReLU² activation
//! - Learned token and position embeddings (token table shared across
//!   encoder and decoder)
//! - RMSNorm normalization in pre-norm blocks
//! - A detachable output head that can be reinitialized for a new task
//! - Prefix-based parameter freezing for fine-tuning
//! - An explicit backward pass producing per-parameter gradient buffers
//! - SafeTensors checkpointing with JSON metadata
//!
//! # Example
//!
//! ```no_run
//! use qatune_model::{Seq2SeqConfig, Seq2Seq, apply_freeze_policy};
//! use aprender::autograd::Tensor;
//!
//! // Create model configuration
//! let config = Seq2SeqConfig::default();
//!
//! // Create model and prepare it for fine-tuning
//! let mut model = Seq2Seq::new(config);
//! model.reinitialize_head(Some(42));
//! apply_freeze_policy(&mut model, 6)?;
//!
//! // Source ids [batch=1, src_len=4] with padding mask, target ids [1, 3]
//! let input_ids = Tensor::new(&[10.0, 11.0, 12.0, 1.0], &[1, 4]);
//! let mask = Tensor::new(&[1.0, 1.0, 1.0, 0.0], &[1, 4]);
//! let labels = Tensor::new(&[20.0, 21.0, 1.0], &[1, 3]);
//!
//! // Training forward pass returns the scalar loss
//! let loss = model.forward_training(&input_ids, Some(&mask), &labels)?;
//!
//! // Save checkpoint
//! use qatune_model::save_checkpoint;
//! save_checkpoint(&model, "checkpoint", None)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod freeze;
pub mod grad;
pub mod head;
mod init;
pub mod loss;
pub mod mlp;
pub mod norm;
pub mod projection;
pub mod seq2seq;
pub mod stability;

// Public API exports

/// Model checkpoint management
///
/// Functions for saving and loading model checkpoints, including weights,
/// configuration, and training metadata.
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};

/// Model configuration
///
/// Defines the architecture hyperparameters for the encoder-decoder model,
/// including layer counts, attention heads, embedding dimensions, sequence
/// limits and special token ids.
pub use config::Seq2SeqConfig;

/// Encoder-decoder model
pub use seq2seq::Seq2Seq;

/// Fine-tuning freeze policy
pub use freeze::{apply_freeze_policy, DEFAULT_TRAINABLE_DECODER_BLOCKS};

/// Token-level cross-entropy
pub use loss::{cross_entropy_loss, cross_entropy_loss_with_grad};

/// Per-parameter gradient buffers produced by `Seq2Seq::forward_backward`
pub use grad::Gradients;

// Re-export common types for convenience
/// Result type alias for error handling
pub use anyhow::Result;
/// Error type alias for error handling
pub use anyhow::Error;
