//! Epoch-driven fine-tuning loop with evaluation and early stopping

use std::path::Path;

use anyhow::{Context, Result};
use qatune_model::{
    load_checkpoint, save_checkpoint, stability::validate_loss, CheckpointMetadata, Gradients,
    Seq2Seq,
};
use qatune_tokenizer::Tokenizer;

use crate::checkpoint_manager::CheckpointManager;
use crate::dataloader::QaBatcher;
use crate::dataset::TokenizedExample;
use crate::early_stopping::EarlyStopping;
use crate::metrics::MetricsLogger;
use crate::optimizer::{
    get_learning_rate, setup_optimizer, update_learning_rate, OptimizerConfig,
};

/// Training loop configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Batch size
    pub batch_size: usize,
    /// Maximum number of epochs
    pub num_epochs: usize,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Checkpoint save interval in optimizer steps
    pub save_steps: usize,
    /// Maximum number of rolling checkpoints
    pub save_total_limit: usize,
    /// Logging interval (optimizer steps)
    pub log_interval: usize,
    /// Epochs without improvement before stopping
    pub early_stopping_patience: usize,
    /// Minimum eval-loss improvement that resets patience
    pub early_stopping_min_delta: f32,
    /// Restore the best checkpoint by eval loss after training
    pub load_best_model_at_end: bool,
    /// Random seed for batch shuffling (None = non-deterministic)
    pub seed: Option<u64>,
    /// Suppress progress output
    pub quiet: bool,
}

/// Fine-tune the model on tokenized question/answer examples
///
/// Runs up to `num_epochs` epochs. Every epoch shuffles the training set,
/// steps the optimizer with gradient accumulation, evaluates on the held-out
/// set, saves an epoch checkpoint, and stops early when the evaluation loss
/// plateaus. Mid-epoch rolling checkpoints are saved every `save_steps`
/// optimizer steps.
///
/// The final model and tokenizer artifacts land in `output_dir`.
///
/// # Arguments
/// * `model` - Pretrained model with the freeze policy already applied
/// * `tokenizer` - Tokenizer to save alongside the final model
/// * `train_examples` - Tokenized training split
/// * `eval_examples` - Tokenized evaluation split
/// * `output_dir` - Directory for checkpoints and final artifacts
/// * `training_config` - Training hyperparameters
/// * `optimizer_config` - Optimizer configuration (None = defaults)
pub fn train(
    model: &mut Seq2Seq,
    tokenizer: &Tokenizer,
    train_examples: Vec<TokenizedExample>,
    eval_examples: Vec<TokenizedExample>,
    output_dir: &Path,
    training_config: &TrainingConfig,
    optimizer_config: Option<OptimizerConfig>,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;
    let checkpoints_dir = output_dir.join("checkpoints");

    let mut train_batcher = QaBatcher::new(
        train_examples,
        training_config.batch_size,
        true,
        training_config.seed,
    )
    .context("Failed to create training batcher")?;
    let mut eval_batcher = QaBatcher::new(
        eval_examples,
        training_config.batch_size,
        false,
        None,
    )
    .context("Failed to create evaluation batcher")?;

    if train_batcher.is_empty() {
        anyhow::bail!("Training set is empty");
    }
    if eval_batcher.is_empty() {
        anyhow::bail!("Evaluation set is empty");
    }

    let optimizer_config = optimizer_config.unwrap_or_default();
    let mut optimizer =
        setup_optimizer(model, &optimizer_config).context("Failed to setup optimizer")?;

    let mut manager = CheckpointManager::new(&checkpoints_dir, training_config.save_total_limit)
        .context("Failed to create checkpoint manager")?;
    let mut metrics_logger = MetricsLogger::new(training_config.log_interval, training_config.quiet);
    let mut early_stopper = EarlyStopping::new(
        training_config.early_stopping_patience,
        training_config.early_stopping_min_delta,
    );

    // Optimizer steps over the whole run, for the linear decay schedule
    let steps_per_epoch = train_batcher
        .num_batches()
        .div_ceil(training_config.gradient_accumulation_steps);
    let total_steps = steps_per_epoch * training_config.num_epochs;

    let mut global_step = 0;

    for epoch in 0..training_config.num_epochs {
        train_batcher.reset();

        let mut accumulated_grads = Gradients::new();
        let mut accumulation_count = 0;

        while let Some((input_ids, attention_mask, labels)) = train_batcher.next_batch() {
            let (loss, grads) = model
                .forward_backward(&input_ids, Some(&attention_mask), &labels)
                .context("Forward training failed")?;
            validate_loss(loss)?;

            accumulated_grads.merge(grads);
            accumulation_count += 1;

            if accumulation_count >= training_config.gradient_accumulation_steps {
                accumulated_grads.scale(1.0 / accumulation_count as f32);
                update_learning_rate(
                    &mut optimizer,
                    global_step,
                    total_steps,
                    optimizer_config.learning_rate,
                );
                optimizer.step(model.trainable_named_parameters_mut(), &accumulated_grads);
                accumulated_grads.clear();

                let learning_rate = get_learning_rate(&optimizer);
                metrics_logger.log_step(epoch, loss, learning_rate);

                global_step += 1;
                accumulation_count = 0;

                if global_step.is_multiple_of(training_config.save_steps) {
                    let metadata = CheckpointMetadata {
                        step: global_step,
                        epoch: Some(epoch),
                        loss: Some(loss),
                        learning_rate: Some(learning_rate),
                        ..Default::default()
                    };
                    let path = manager.save(
                        model,
                        &format!("checkpoint_{global_step}"),
                        Some(metadata),
                    )?;
                    if !training_config.quiet {
                        println!("Saved checkpoint at step {} to {:?}", global_step, path);
                    }
                }
            }
        }

        // Flush a trailing partial accumulation window
        if accumulation_count > 0 {
            accumulated_grads.scale(1.0 / accumulation_count as f32);
            update_learning_rate(
                &mut optimizer,
                global_step,
                total_steps,
                optimizer_config.learning_rate,
            );
            optimizer.step(model.trainable_named_parameters_mut(), &accumulated_grads);
            accumulated_grads.clear();
            global_step += 1;
        }

        // End-of-epoch evaluation
        let eval_loss = evaluate(model, &mut eval_batcher).context("Evaluation failed")?;
        metrics_logger.log_eval(epoch, eval_loss);

        let metadata = CheckpointMetadata {
            step: global_step,
            epoch: Some(epoch),
            eval_loss: Some(eval_loss),
            learning_rate: Some(get_learning_rate(&optimizer)),
            ..Default::default()
        };
        let epoch_path = manager.save(model, &format!("epoch_{epoch}"), Some(metadata))?;
        manager.record_best(eval_loss, &epoch_path);

        if early_stopper.observe(eval_loss) {
            if !training_config.quiet {
                println!(
                    "Early stopping after epoch {}: no improvement for {} epochs",
                    epoch, training_config.early_stopping_patience
                );
            }
            break;
        }
    }

    // Restore the checkpoint with the lowest evaluation loss
    if training_config.load_best_model_at_end {
        if let Some((best_loss, best_path)) = manager.best() {
            let (best_model, _) =
                load_checkpoint(best_path).context("Failed to load best checkpoint")?;
            *model = best_model;
            if !training_config.quiet {
                println!("Restored best model (eval_loss={:.6})", best_loss);
            }
        }
    }

    // Final artifacts: model weights plus the tokenizer that produced the data
    let final_path = output_dir.join("model");
    let metadata = CheckpointMetadata {
        step: global_step,
        eval_loss: early_stopper.best_loss(),
        ..Default::default()
    };
    save_checkpoint(model, &final_path, Some(metadata))
        .context("Failed to save final model")?;
    tokenizer
        .save(output_dir)
        .context("Failed to save tokenizer")?;

    if !training_config.quiet {
        println!("Training completed! Final model saved to {:?}", final_path);
    }

    Ok(())
}

/// Compute the mean loss over the evaluation set
///
/// Uses the dropout-free forward pass and no backward pass; batch losses
/// are weighted by batch size so the result is a per-example mean.
pub fn evaluate(model: &Seq2Seq, eval_batcher: &mut QaBatcher) -> Result<f32> {
    eval_batcher.reset();

    let mut total_loss = 0.0;
    let mut total_examples = 0usize;

    while let Some((input_ids, attention_mask, labels)) = eval_batcher.next_batch() {
        let batch_size = input_ids.shape()[0];
        let loss = model
            .forward_training(&input_ids, Some(&attention_mask), &labels)
            .context("Evaluation forward failed")?;

        total_loss += loss.item() * batch_size as f32;
        total_examples += batch_size;
    }

    if total_examples == 0 {
        anyhow::bail!("Evaluation set produced no batches");
    }
    Ok(total_loss / total_examples as f32)
}
