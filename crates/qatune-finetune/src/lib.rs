//! Question/answer fine-tuning pipeline
//!
//! This crate adapts a pretrained encoder-decoder model to a question/answer
//! dataset: it loads `query,answer` CSV data, splits off an evaluation set,
//! tokenizes to fixed-length sequences, and runs an epoch-driven training
//! loop with gradient accumulation, rolling checkpoints, per-epoch
//! evaluation, early stopping and best-model restore.

pub mod checkpoint_manager;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod early_stopping;
pub mod metrics;
pub mod optimizer;
pub mod train;
