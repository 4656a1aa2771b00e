//! BPE tokenizer for question/answer fine-tuning
//!
//! This crate provides:
//! - Byte Pair Encoding (BPE) training over a QA corpus
//! - Token encoding and decoding
//! - Fixed-length source/target encoding with padding masks
//! - Directory-based save/load compatible with model artifacts
//!
//! # Example
//!
//! ```no_run
//! use qatune_tokenizer::Tokenizer;
//!
//! // Train a tokenizer
//! let corpus = ["what is rust?", "a systems programming language"];
//! let tokenizer = Tokenizer::train_from_iterator(corpus.iter(), 500).expect("Failed to train");
//!
//! // Fixed-length question encoding: ids plus padding mask, both length 512
//! let (ids, mask) = tokenizer.encode_source("what is rust?", 512, 1).expect("Encoding failed");
//! assert_eq!(ids.len(), 512);
//! assert_eq!(mask.len(), 512);
//! ```

// Re-export aprender types for callers that need the raw BPE interface
pub use aprender::text::tokenize::BpeTokenizer;

use std::path::Path;

use anyhow::{Context, Result};

pub mod special_tokens;
pub use special_tokens::SpecialTokens;

/// Serialized tokenizer data
///
/// Only the vocabulary and merge rules are persisted; everything else is
/// derivable.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TokenizerData {
    /// Token to ID mapping
    pub vocabulary: std::collections::HashMap<String, u32>,
    /// BPE merge rules
    pub merges: Vec<(String, String)>,
}

/// Main tokenizer interface
///
/// Wraps `aprender::text::tokenize::BpeTokenizer` and adds the fixed-length
/// encoding the training pipeline feeds to the model.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    bpe: BpeTokenizer,
}

impl Tokenizer {
    /// Train a new tokenizer from an iterator of text
    ///
    /// The lowest ids are reserved for the special tokens (bos = 0, pad = 1,
    /// eos = 2); BPE subwords start at id 3, so ordinary text can never
    /// encode to a reserved id.
    ///
    /// # Arguments
    /// * `text_iterator` - Iterator over training text
    /// * `vocab_size` - Target vocabulary size, including the reserved ids
    pub fn train_from_iterator<I, S>(text_iterator: I, vocab_size: usize) -> Result<Self>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        let specials = SpecialTokens::default();
        let reserved = specials.all().len();
        if vocab_size <= reserved {
            anyhow::bail!(
                "Vocabulary size {} leaves no room beyond the {} reserved special tokens",
                vocab_size,
                reserved
            );
        }

        // Own the strings first so the references live long enough for
        // aprender's API
        let corpus_owned: Vec<String> = text_iterator.map(|s| s.as_ref().to_string()).collect();
        let corpus: Vec<&str> = corpus_owned.iter().map(|s| s.as_str()).collect();

        let bpe = BpeTokenizer::train(&corpus, vocab_size - reserved)
            .map_err(|e| anyhow::anyhow!("Failed to train BPE tokenizer: {}", e))?;

        // Renumber the trained subwords above the reserved range. Merge
        // rules are token-string pairs, so they survive the renumbering.
        let mut vocabulary = std::collections::HashMap::new();
        for (id, token) in specials.all().iter().enumerate() {
            vocabulary.insert((*token).to_string(), id as u32);
        }
        let mut trained: Vec<(String, u32)> = bpe
            .vocab()
            .iter()
            .filter(|(token, _)| !specials.all().contains(&token.as_str()))
            .map(|(token, &id)| (token.clone(), id))
            .collect();
        trained.sort_by_key(|&(_, id)| id);
        for (next, (token, _)) in trained.into_iter().enumerate() {
            vocabulary.insert(token, (reserved + next) as u32);
        }

        let bpe = BpeTokenizer::from_vocab(vocabulary, bpe.merges().to_vec());
        Ok(Self { bpe })
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.bpe
            .encode(text)
            .map_err(|e| anyhow::anyhow!("Encoding failed: {}", e))
    }

    /// Decode token IDs to text
    ///
    /// Special-token ids (bos, pad, eos) are dropped from the output.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let specials = SpecialTokens::default();
        let reserved: Vec<u32> = specials
            .all()
            .iter()
            .filter_map(|token| self.bpe.token_to_id(token))
            .collect();
        let content: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|id| !reserved.contains(id))
            .collect();

        self.bpe
            .decode(&content)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Encode a question into a fixed-length id sequence with padding mask
    ///
    /// Sequences longer than `max_len` are truncated; shorter ones padded
    /// with `pad_id`. The mask holds 1 at real positions and 0 at padding.
    ///
    /// # Arguments
    /// * `text` - Question text
    /// * `max_len` - Fixed output length
    /// * `pad_id` - Padding token id
    ///
    /// # Returns
    /// Tuple of (token ids, attention mask), both of length `max_len`
    pub fn encode_source(
        &self,
        text: &str,
        max_len: usize,
        pad_id: u32,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut ids = self.encode(text)?;
        ids.truncate(max_len);

        let real_len = ids.len();
        let mut mask = vec![1u32; real_len];
        ids.resize(max_len, pad_id);
        mask.resize(max_len, 0);

        Ok((ids, mask))
    }

    /// Encode an answer into a fixed-length id sequence
    ///
    /// The sequence is terminated with `eos_id` (truncating first if needed
    /// so the terminator always fits) and padded with `pad_id` to `max_len`.
    /// The loss ignores the padding positions.
    ///
    /// # Arguments
    /// * `text` - Answer text
    /// * `max_len` - Fixed output length
    /// * `pad_id` - Padding token id
    /// * `eos_id` - End-of-sequence token id
    pub fn encode_target(
        &self,
        text: &str,
        max_len: usize,
        pad_id: u32,
        eos_id: u32,
    ) -> Result<Vec<u32>> {
        if max_len == 0 {
            anyhow::bail!("Target length must be at least 1 to hold the EOS token");
        }

        let mut ids = self.encode(text)?;
        ids.truncate(max_len - 1);
        ids.push(eos_id);
        ids.resize(max_len, pad_id);

        Ok(ids)
    }

    /// Get the ID for a special token
    ///
    /// # Errors
    /// Returns an error if the token is not in the vocabulary.
    pub fn special_token_id(&self, token: &str) -> Result<u32> {
        self.bpe
            .token_to_id(token)
            .ok_or_else(|| anyhow::anyhow!("Special token not found: {}", token))
    }

    /// Beginning-of-sequence token id
    pub fn bos_id(&self) -> Result<u32> {
        self.special_token_id(SpecialTokens::default().bos())
    }

    /// Padding token id
    pub fn pad_id(&self) -> Result<u32> {
        self.special_token_id(SpecialTokens::default().pad())
    }

    /// End-of-sequence token id
    pub fn eos_id(&self) -> Result<u32> {
        self.special_token_id(SpecialTokens::default().eos())
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// Load tokenizer from a directory containing `tokenizer.json`
    ///
    /// # Errors
    /// Returns an error if the tokenizer file cannot be read or parsed.
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        use std::fs;

        let path = path.as_ref();
        let tokenizer_file = path.join("tokenizer.json");

        if !tokenizer_file.exists() {
            anyhow::bail!("Tokenizer file not found: {}", tokenizer_file.display());
        }

        let content = fs::read_to_string(&tokenizer_file).with_context(|| {
            format!(
                "Failed to read tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        let data: TokenizerData =
            serde_json::from_str(&content).context("Failed to parse tokenizer JSON")?;

        let bpe = BpeTokenizer::from_vocab(data.vocabulary, data.merges);

        Ok(Self { bpe })
    }

    /// Save tokenizer to a directory as `tokenizer.json`
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the tokenizer
    /// cannot be serialized.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::fs;

        let path = path.as_ref();
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        let tokenizer_file = path.join("tokenizer.json");

        let data = TokenizerData {
            vocabulary: self.bpe.vocab().clone(),
            merges: self.bpe.merges().to_vec(),
        };

        // Compact JSON keeps the artifact small
        let content = serde_json::to_string(&data).context("Failed to serialize tokenizer")?;

        fs::write(&tokenizer_file, content).with_context(|| {
            format!(
                "Failed to write tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tokenizer() -> Tokenizer {
        let corpus = ["what is rust?", "a systems programming language", "hello"];
        Tokenizer::train_from_iterator(corpus.iter(), 400).expect("Failed to train tokenizer")
    }

    #[test]
    fn test_train_and_encode() {
        let tokenizer = small_tokenizer();
        let ids = tokenizer.encode("hello").expect("Encoding failed");
        assert!(!ids.is_empty());
    }

    #[test]
    fn test_encode_source_fixed_length() {
        let tokenizer = small_tokenizer();
        let (ids, mask) = tokenizer
            .encode_source("what is rust?", 32, 1)
            .expect("Encoding failed");

        assert_eq!(ids.len(), 32);
        assert_eq!(mask.len(), 32);

        // Mask is a run of ones followed by zeros matching the padding
        let real_len = mask.iter().filter(|&&m| m == 1).count();
        assert!(real_len > 0);
        assert!(mask[..real_len].iter().all(|&m| m == 1));
        assert!(mask[real_len..].iter().all(|&m| m == 0));
        assert!(ids[real_len..].iter().all(|&id| id == 1));
    }

    #[test]
    fn test_encode_source_truncates() {
        let tokenizer = small_tokenizer();
        let long_text = "hello ".repeat(100);
        let (ids, mask) = tokenizer
            .encode_source(&long_text, 8, 1)
            .expect("Encoding failed");

        assert_eq!(ids.len(), 8);
        assert!(mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_encode_target_ends_with_eos_before_padding() {
        let tokenizer = small_tokenizer();
        let ids = tokenizer
            .encode_target("hello", 16, 1, 2)
            .expect("Encoding failed");

        assert_eq!(ids.len(), 16);
        let last_real = ids.iter().rposition(|&id| id != 1).expect("all padding");
        assert_eq!(ids[last_real], 2);
    }

    #[test]
    fn test_encode_target_truncation_keeps_eos() {
        let tokenizer = small_tokenizer();
        let long_text = "hello ".repeat(100);
        let ids = tokenizer
            .encode_target(&long_text, 8, 1, 2)
            .expect("Encoding failed");

        assert_eq!(ids.len(), 8);
        assert_eq!(ids[7], 2);
    }

    #[test]
    fn test_encode_target_zero_length_rejected() {
        let tokenizer = small_tokenizer();
        assert!(tokenizer.encode_target("hello", 0, 1, 2).is_err());
    }

    #[test]
    fn test_encode_deterministic() {
        let tokenizer = small_tokenizer();
        let a = tokenizer.encode("what is rust?").expect("encode");
        let b = tokenizer.encode("what is rust?").expect("encode");
        assert_eq!(a, b);
    }

    #[test]
    fn test_special_tokens_hold_lowest_ids() {
        let tokenizer = small_tokenizer();
        assert_eq!(tokenizer.bos_id().expect("bos"), 0);
        assert_eq!(tokenizer.pad_id().expect("pad"), 1);
        assert_eq!(tokenizer.eos_id().expect("eos"), 2);
    }

    #[test]
    fn test_ordinary_text_never_encodes_to_reserved_ids() {
        let tokenizer = small_tokenizer();
        for text in ["what is rust?", "a systems programming language", "hello"] {
            let ids = tokenizer.encode(text).expect("encode");
            assert!(
                ids.iter().all(|&id| id >= 3),
                "reserved id in encoding of {:?}: {:?}",
                text,
                ids
            );
        }
    }

    #[test]
    fn test_decode_drops_special_ids() {
        let tokenizer = small_tokenizer();
        let mut ids = tokenizer.encode("hello").expect("encode");
        let plain = tokenizer.decode(&ids).expect("decode");

        ids.push(tokenizer.eos_id().expect("eos"));
        ids.push(tokenizer.pad_id().expect("pad"));
        assert_eq!(tokenizer.decode(&ids).expect("decode"), plain);
    }

    #[test]
    fn test_vocab_size_too_small_rejected() {
        let corpus = ["hello"];
        assert!(Tokenizer::train_from_iterator(corpus.iter(), 3).is_err());
    }
}
