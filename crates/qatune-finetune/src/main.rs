//! Fine-tuning binary for question/answer models
//!
//! Loads a pretrained encoder-decoder checkpoint, replaces its output head,
//! freezes everything except the head and the last decoder blocks, and
//! fine-tunes on a CSV of question/answer pairs.
//!
//! # Usage
//!
//! ```bash
//! qatune-finetune \
//!   --data ./qa_dataset.csv \
//!   --pretrained ./pretrained_model \
//!   --output-dir ./finetuned_model \
//!   [--config config.json] \
//!   [--seed 42] \
//!   [--workers 4] \
//!   [--quiet]
//! ```
//!
//! The pretrained directory must hold `model.safetensors`, `model.json` and
//! `tokenizer.json`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use qatune_finetune::{
    config::TrainingConfigFile,
    dataset::{load_qa_csv, split_train_eval, tokenize_records},
    optimizer::OptimizerConfig,
    train::{train, TrainingConfig},
};
use qatune_model::{apply_freeze_policy, load_checkpoint};
use qatune_tokenizer::Tokenizer;

/// Fine-tune a pretrained encoder-decoder model on question/answer pairs
#[derive(Parser, Debug)]
#[command(name = "qatune-finetune")]
#[command(
    about = "Fine-tune a pretrained encoder-decoder model on question/answer pairs",
    long_about = None
)]
struct Args {
    /// Path to CSV dataset with query,answer columns
    #[arg(long, value_name = "PATH", required = true)]
    data: PathBuf,

    /// Directory containing the pretrained model and tokenizer
    #[arg(long, value_name = "PATH", required = true)]
    pretrained: PathBuf,

    /// Directory for checkpoints and final artifacts
    #[arg(long, value_name = "PATH", required = true)]
    output_dir: PathBuf,

    /// Path to training configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Random seed overriding the config file
    #[arg(long)]
    seed: Option<u64>,

    /// Number of data loading workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Suppress progress output
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", args.output_dir))?;

    // Load configuration from file or use defaults
    let mut config_file = if let Some(config_path) = &args.config {
        TrainingConfigFile::from_file(config_path).context("Failed to load config file")?
    } else {
        TrainingConfigFile::default()
    };
    if args.seed.is_some() {
        config_file.training.seed = args.seed;
    }
    config_file.training.num_workers = args.workers;
    let seed = config_file.training.seed;

    // Load pretrained model and tokenizer from the same directory
    let (mut model, _metadata) = load_checkpoint(args.pretrained.join("model"))
        .with_context(|| format!("Failed to load pretrained model from: {:?}", args.pretrained))?;
    let tokenizer = Tokenizer::from_directory(&args.pretrained).with_context(|| {
        format!(
            "Failed to load tokenizer. Ensure tokenizer.json exists in {:?}",
            args.pretrained
        )
    })?;

    model
        .config()
        .validate_vocab_size(tokenizer.vocab_size())
        .context("Tokenizer-model incompatibility")?;

    // The model's reserved ids must match the tokenizer's, or padding and
    // loss masking silently target real subwords
    let pad_id = tokenizer.pad_id().context("Tokenizer has no pad token")?;
    let eos_id = tokenizer.eos_id().context("Tokenizer has no eos token")?;
    if pad_id != model.config().pad_token_id || eos_id != model.config().eos_token_id {
        anyhow::bail!(
            "Tokenizer special ids (pad={}, eos={}) do not match model config (pad={}, eos={})",
            pad_id,
            eos_id,
            model.config().pad_token_id,
            model.config().eos_token_id
        );
    }

    // Fresh output head, then freeze everything except it and the last
    // decoder blocks
    model.reinitialize_head(seed);
    apply_freeze_policy(&mut model, config_file.training.trainable_decoder_blocks)
        .context("Failed to apply freeze policy")?;

    if !args.quiet {
        println!(
            "Trainable parameters: {} / {}",
            model.num_trainable_parameters(),
            model.num_parameters()
        );
    }

    // Load, split and tokenize the dataset
    let records = load_qa_csv(&args.data)
        .with_context(|| format!("Failed to load dataset: {:?}", args.data))?;
    let (train_records, eval_records) =
        split_train_eval(records, config_file.training.eval_fraction, seed)
            .context("Failed to split dataset")?;

    if !args.quiet {
        println!(
            "Dataset: {} training / {} evaluation pairs",
            train_records.len(),
            eval_records.len()
        );
    }

    let model_config = model.config().clone();
    let train_examples = tokenize_records(
        &tokenizer,
        &train_records,
        model_config.max_source_len,
        model_config.max_target_len,
        model_config.pad_token_id,
        model_config.eos_token_id,
    )
    .context("Failed to tokenize training set")?;
    let eval_examples = tokenize_records(
        &tokenizer,
        &eval_records,
        model_config.max_source_len,
        model_config.max_target_len,
        model_config.pad_token_id,
        model_config.eos_token_id,
    )
    .context("Failed to tokenize evaluation set")?;

    let optimizer_config = OptimizerConfig {
        learning_rate: config_file.optimizer.learning_rate,
        weight_decay: config_file.optimizer.weight_decay,
        beta1: config_file.optimizer.beta1,
        beta2: config_file.optimizer.beta2,
        eps: config_file.optimizer.eps,
    };

    let training_config = TrainingConfig {
        batch_size: config_file.training.batch_size,
        num_epochs: config_file.training.num_epochs,
        gradient_accumulation_steps: config_file.training.gradient_accumulation_steps,
        save_steps: config_file.training.save_steps,
        save_total_limit: config_file.training.save_total_limit,
        log_interval: config_file.training.log_interval,
        early_stopping_patience: config_file.training.early_stopping_patience,
        early_stopping_min_delta: config_file.training.early_stopping_min_delta,
        load_best_model_at_end: config_file.training.load_best_model_at_end,
        seed,
        quiet: args.quiet,
    };

    train(
        &mut model,
        &tokenizer,
        train_examples,
        eval_examples,
        &args.output_dir,
        &training_config,
        Some(optimizer_config),
    )
    .context("Training failed")?;

    if !args.quiet {
        println!("Fine-tuning completed successfully!");
    }

    Ok(())
}
