//! Batching for tokenized question/answer examples

use anyhow::Result;
use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::TokenizedExample;

/// Batcher over tokenized examples
///
/// Yields `(input_ids, attention_mask, labels)` tensors of shape
/// `[batch, len]` with token ids stored as f32. Examples are shuffled at
/// construction and on every `reset`; the final short batch of an epoch is
/// yielded rather than dropped.
pub struct QaBatcher {
    examples: Vec<TokenizedExample>,
    batch_size: usize,
    current_pos: usize,
    rng: StdRng,
    shuffle: bool,
}

impl QaBatcher {
    /// Create a new batcher
    ///
    /// # Arguments
    /// * `examples` - Tokenized examples, all with identical sequence lengths
    /// * `batch_size` - Maximum examples per batch
    /// * `shuffle` - Reshuffle on construction and reset (off for evaluation)
    /// * `seed` - Optional random seed for reproducibility
    ///
    /// # Errors
    /// Returns an error if `batch_size` is zero or the examples disagree on
    /// sequence lengths.
    pub fn new(
        examples: Vec<TokenizedExample>,
        batch_size: usize,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }
        if let Some(first) = examples.first() {
            let src_len = first.input_ids.len();
            let tgt_len = first.labels.len();
            for example in &examples {
                if example.input_ids.len() != src_len
                    || example.attention_mask.len() != src_len
                    || example.labels.len() != tgt_len
                {
                    anyhow::bail!("Examples have inconsistent sequence lengths");
                }
            }
        }

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let mut batcher = Self {
            examples,
            batch_size,
            current_pos: 0,
            rng,
            shuffle,
        };
        if batcher.shuffle {
            batcher.examples.shuffle(&mut batcher.rng);
        }
        Ok(batcher)
    }

    /// Get the next batch, or None when the epoch is exhausted
    ///
    /// # Returns
    /// Tuple of `(input_ids, attention_mask, labels)` tensors; the first
    /// dimension is the actual batch size, which may be smaller than the
    /// configured one for the last batch of an epoch.
    pub fn next_batch(&mut self) -> Option<(Tensor, Tensor, Tensor)> {
        if self.current_pos >= self.examples.len() {
            return None;
        }

        let end = (self.current_pos + self.batch_size).min(self.examples.len());
        let batch = &self.examples[self.current_pos..end];
        self.current_pos = end;

        let actual = batch.len();
        let src_len = batch[0].input_ids.len();
        let tgt_len = batch[0].labels.len();

        let mut inputs = Vec::with_capacity(actual * src_len);
        let mut mask = Vec::with_capacity(actual * src_len);
        let mut labels = Vec::with_capacity(actual * tgt_len);

        for example in batch {
            inputs.extend(example.input_ids.iter().map(|&id| id as f32));
            mask.extend(example.attention_mask.iter().map(|&m| m as f32));
            labels.extend(example.labels.iter().map(|&id| id as f32));
        }

        Some((
            Tensor::new(&inputs, &[actual, src_len]),
            Tensor::new(&mask, &[actual, src_len]),
            Tensor::new(&labels, &[actual, tgt_len]),
        ))
    }

    /// Reset to the beginning of a new epoch, reshuffling if enabled
    pub fn reset(&mut self) {
        self.current_pos = 0;
        if self.shuffle {
            self.examples.shuffle(&mut self.rng);
        }
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the batcher holds no examples
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(id: u32) -> TokenizedExample {
        TokenizedExample {
            input_ids: vec![id, id + 1, 1, 1],
            attention_mask: vec![1, 1, 0, 0],
            labels: vec![id + 2, 2, 1],
        }
    }

    #[test]
    fn test_batch_shapes() {
        let examples = (0..5).map(|i| example(i * 10)).collect();
        let mut batcher = QaBatcher::new(examples, 2, false, None).expect("batcher");

        let (inputs, mask, labels) = batcher.next_batch().expect("first batch");
        assert_eq!(inputs.shape(), &[2, 4]);
        assert_eq!(mask.shape(), &[2, 4]);
        assert_eq!(labels.shape(), &[2, 3]);
    }

    #[test]
    fn test_final_short_batch_yielded() {
        let examples = (0..5).map(|i| example(i * 10)).collect();
        let mut batcher = QaBatcher::new(examples, 2, false, None).expect("batcher");
        assert_eq!(batcher.num_batches(), 3);

        batcher.next_batch().expect("batch 1");
        batcher.next_batch().expect("batch 2");
        let (inputs, _, _) = batcher.next_batch().expect("short batch");
        assert_eq!(inputs.shape(), &[1, 4]);
        assert!(batcher.next_batch().is_none());
    }

    #[test]
    fn test_reset_restores_epoch() {
        let examples = (0..3).map(|i| example(i * 10)).collect();
        let mut batcher = QaBatcher::new(examples, 2, false, None).expect("batcher");

        while batcher.next_batch().is_some() {}
        batcher.reset();
        assert!(batcher.next_batch().is_some());
    }

    #[test]
    fn test_shuffle_deterministic_with_seed() {
        let examples: Vec<TokenizedExample> = (0..8).map(|i| example(i * 10)).collect();
        let mut a = QaBatcher::new(examples.clone(), 8, true, Some(42)).expect("batcher");
        let mut b = QaBatcher::new(examples, 8, true, Some(42)).expect("batcher");

        let (inputs_a, _, _) = a.next_batch().expect("batch");
        let (inputs_b, _, _) = b.next_batch().expect("batch");
        assert_eq!(inputs_a.data(), inputs_b.data());
    }

    #[test]
    fn test_eval_order_preserved_without_shuffle() {
        let examples: Vec<TokenizedExample> = (0..3).map(|i| example(i * 10)).collect();
        let mut batcher = QaBatcher::new(examples, 1, false, None).expect("batcher");

        let (inputs, _, _) = batcher.next_batch().expect("batch");
        assert_eq!(inputs.data()[0], 0.0);
        let (inputs, _, _) = batcher.next_batch().expect("batch");
        assert_eq!(inputs.data()[0], 10.0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(QaBatcher::new(vec![example(0)], 0, false, None).is_err());
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut bad = example(0);
        bad.labels.push(9);
        assert!(QaBatcher::new(vec![example(1), bad], 2, false, None).is_err());
    }
}
