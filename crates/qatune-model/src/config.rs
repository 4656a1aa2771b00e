//! Model configuration

use serde::{Deserialize, Serialize};

/// Encoder-decoder model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    /// Vocabulary size (must match tokenizer)
    pub vocab_size: usize,
    /// Number of encoder blocks
    pub n_encoder_layer: usize,
    /// Number of decoder blocks
    pub n_decoder_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Maximum source sequence length
    pub max_source_len: usize,
    /// Maximum target sequence length
    pub max_target_len: usize,
    /// Padding token id (ignored in the loss)
    pub pad_token_id: u32,
    /// End-of-sequence token id (terminates every target)
    pub eos_token_id: u32,
    /// Token prepended to the shifted decoder input
    pub decoder_start_token_id: u32,
    /// Dropout probability (None = disabled)
    pub dropout: Option<f32>,
    /// Random seed for weight initialization (None = non-deterministic)
    pub seed: Option<u64>,
}

impl Default for Seq2SeqConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50265,
            n_encoder_layer: 12,
            n_decoder_layer: 12,
            n_head: 16,
            n_embd: 1024,
            max_source_len: 512,
            max_target_len: 150,
            pad_token_id: 1,
            eos_token_id: 2,
            decoder_start_token_id: 2,
            dropout: None,
            seed: None,
        }
    }
}

impl Seq2SeqConfig {
    /// Small configuration for tests
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            n_encoder_layer: 2,
            n_decoder_layer: 2,
            n_head: 2,
            n_embd: 32,
            max_source_len: 32,
            max_target_len: 16,
            pad_token_id: 1,
            eos_token_id: 2,
            decoder_start_token_id: 2,
            dropout: None,
            seed: Some(42),
        }
    }

    /// Validate that the tokenizer vocabulary fits this model
    ///
    /// # Errors
    /// Returns an error if the tokenizer vocabulary is larger than the
    /// model's output projection.
    pub fn validate_vocab_size(&self, tokenizer_vocab_size: usize) -> anyhow::Result<()> {
        if tokenizer_vocab_size > self.vocab_size {
            anyhow::bail!(
                "Tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer_vocab_size,
                self.vocab_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Seq2SeqConfig::default();
        assert_eq!(config.max_source_len, 512);
        assert_eq!(config.max_target_len, 150);
        assert_eq!(config.n_decoder_layer, 12);
    }

    #[test]
    fn test_vocab_validation() {
        let config = Seq2SeqConfig::tiny();
        assert!(config.validate_vocab_size(200).is_ok());
        assert!(config.validate_vocab_size(256).is_ok());
        assert!(config.validate_vocab_size(257).is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = Seq2SeqConfig::tiny();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: Seq2SeqConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
