//! Fine-tuning freeze policy
//!
//! Pretrained weights stay fixed except for the output head and the last few
//! decoder blocks, which carry most of the task adaptation.

use anyhow::Result;

use crate::seq2seq::Seq2Seq;

/// Number of trailing decoder blocks left trainable during fine-tuning
pub const DEFAULT_TRAINABLE_DECODER_BLOCKS: usize = 6;

/// Freeze the model for fine-tuning
///
/// Freezes every parameter, then unfreezes the output head and the last
/// `trainable_blocks` decoder blocks. Idempotent.
///
/// # Errors
/// Returns an error if `trainable_blocks` exceeds the decoder depth.
pub fn apply_freeze_policy(model: &mut Seq2Seq, trainable_blocks: usize) -> Result<()> {
    let n_decoder = model.decoder.blocks.len();
    if trainable_blocks > n_decoder {
        anyhow::bail!(
            "Cannot unfreeze {} decoder blocks, model only has {}",
            trainable_blocks,
            n_decoder
        );
    }

    model.freeze_all();
    model.unfreeze_prefix("lm_head");
    for i in n_decoder - trainable_blocks..n_decoder {
        model.unfreeze_prefix(&format!("decoder.blocks.{i}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Seq2SeqConfig;

    #[test]
    fn test_policy_unfreezes_head_and_tail_blocks() {
        let mut config = Seq2SeqConfig::tiny();
        config.n_decoder_layer = 4;
        let mut model = Seq2Seq::new(config);

        apply_freeze_policy(&mut model, 2).unwrap();

        assert!(model.is_trainable("lm_head.weight"));
        assert!(model.is_trainable("decoder.blocks.2.self_attn.0"));
        assert!(model.is_trainable("decoder.blocks.3.ffn.0"));
        assert!(!model.is_trainable("decoder.blocks.0.self_attn.0"));
        assert!(!model.is_trainable("decoder.blocks.1.ffn.0"));
        assert!(!model.is_trainable("encoder.blocks.0.self_attn.0"));
        assert!(!model.is_trainable("embedding.token"));
    }

    #[test]
    fn test_policy_is_idempotent() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());

        apply_freeze_policy(&mut model, 1).unwrap();
        let first = model.trainable_prefixes();
        apply_freeze_policy(&mut model, 1).unwrap();
        assert_eq!(model.trainable_prefixes(), first);
    }

    #[test]
    fn test_policy_rejects_too_many_blocks() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let depth = model.decoder.blocks.len();
        assert!(apply_freeze_policy(&mut model, depth + 1).is_err());
        assert!(apply_freeze_policy(&mut model, depth).is_ok());
    }

    #[test]
    fn test_policy_reduces_trainable_count() {
        let mut model = Seq2Seq::new(Seq2SeqConfig::tiny());
        let total = model.num_parameters();

        apply_freeze_policy(&mut model, 1).unwrap();
        let trainable = model.num_trainable_parameters();
        assert!(trainable > 0);
        assert!(trainable < total);
    }
}
