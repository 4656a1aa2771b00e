//! Output projection head
//!
//! Kept separate from the decoder so a pretrained model's head can be thrown
//! away and reinitialized before fine-tuning while every other weight is
//! loaded as-is.

use anyhow::Result;
use aprender::autograd::Tensor;

use crate::init::init_projection_weight;

/// Vocabulary projection head
pub struct OutputHead {
    /// Weight tensor [vocab_size, n_embd]
    weight: Tensor,
    /// Vocabulary size
    vocab_size: usize,
    /// Embedding dimension
    n_embd: usize,
}

impl OutputHead {
    /// Create a new head with random initialization
    pub fn new(n_embd: usize, vocab_size: usize, seed: Option<u64>) -> Self {
        Self {
            weight: init_projection_weight(n_embd, vocab_size, seed),
            vocab_size,
            n_embd,
        }
    }

    /// Discard the current weights and draw fresh ones
    ///
    /// Used when adapting a pretrained model to a new output distribution.
    pub fn reinitialize(&mut self, seed: Option<u64>) {
        self.weight = init_projection_weight(self.n_embd, self.vocab_size, seed);
    }

    /// Project hidden states onto the vocabulary
    ///
    /// # Arguments
    /// * `hidden` - Decoder output [batch, seq_len, n_embd]
    ///
    /// # Returns
    /// Logits [batch, seq_len, vocab_size]
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let shape = hidden.shape();
        if shape.len() != 3 || shape[2] != self.n_embd {
            anyhow::bail!(
                "Expected hidden states [batch, seq_len, {}], got {:?}",
                self.n_embd,
                shape
            );
        }

        let batch = shape[0];
        let seq_len = shape[1];
        let h = hidden.data();
        let w = self.weight.data();

        let mut logits = vec![0.0; batch * seq_len * self.vocab_size];
        for t in 0..batch * seq_len {
            let h_row = &h[t * self.n_embd..(t + 1) * self.n_embd];
            for v in 0..self.vocab_size {
                let w_row = &w[v * self.n_embd..(v + 1) * self.n_embd];
                let mut sum = 0.0;
                for d in 0..self.n_embd {
                    sum += h_row[d] * w_row[d];
                }
                logits[t * self.vocab_size + v] = sum;
            }
        }

        Ok(Tensor::new(&logits, &[batch, seq_len, self.vocab_size]))
    }

    /// Backward pass
    ///
    /// # Arguments
    /// * `hidden` - The forward input [batch, seq_len, n_embd]
    /// * `d_logits` - Gradient w.r.t. the logits [batch, seq_len, vocab_size]
    ///
    /// # Returns
    /// (gradient w.r.t. the hidden states, flat weight gradient)
    pub fn backward(&self, hidden: &Tensor, d_logits: &Tensor) -> (Tensor, Vec<f32>) {
        let shape = hidden.shape();
        let rows = shape[0] * shape[1];
        let h = hidden.data();
        let w = self.weight.data();
        let dy = d_logits.data();

        let mut d_hidden = vec![0.0; h.len()];
        let mut d_weight = vec![0.0; w.len()];

        for t in 0..rows {
            let h_row = &h[t * self.n_embd..(t + 1) * self.n_embd];
            let dy_row = &dy[t * self.vocab_size..(t + 1) * self.vocab_size];
            let dh_row = &mut d_hidden[t * self.n_embd..(t + 1) * self.n_embd];
            for v in 0..self.vocab_size {
                let g = dy_row[v];
                if g == 0.0 {
                    continue;
                }
                let w_row = &w[v * self.n_embd..(v + 1) * self.n_embd];
                let dw_row = &mut d_weight[v * self.n_embd..(v + 1) * self.n_embd];
                for d in 0..self.n_embd {
                    dh_row[d] += g * w_row[d];
                    dw_row[d] += g * h_row[d];
                }
            }
        }

        (Tensor::new(&d_hidden, shape), d_weight)
    }

    /// Access the weight tensor
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Mutable access to the weight tensor
    pub fn weight_mut(&mut self) -> &mut Tensor {
        &mut self.weight
    }

    /// Replace the weight tensor
    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.shape() != [self.vocab_size, self.n_embd] {
            anyhow::bail!(
                "Head weight shape {:?} does not match [{}, {}]",
                weight.shape(),
                self.vocab_size,
                self.n_embd
            );
        }
        self.weight = weight;
        Ok(())
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_forward_shape() {
        let head = OutputHead::new(8, 16, Some(42));
        let hidden = Tensor::ones(&[2, 3, 8]);

        let logits = head.forward(&hidden).unwrap();
        assert_eq!(logits.shape(), &[2, 3, 16]);
    }

    #[test]
    fn test_head_rejects_wrong_dim() {
        let head = OutputHead::new(8, 16, Some(42));
        let hidden = Tensor::ones(&[2, 3, 4]);
        assert!(head.forward(&hidden).is_err());
    }

    #[test]
    fn test_backward_shapes_and_values() {
        let head = OutputHead::new(2, 3, Some(5));
        let hidden = Tensor::new(&[1.0, -1.0], &[1, 1, 2]);
        let d_logits = Tensor::new(&[0.5, 0.0, -0.25], &[1, 1, 3]);

        let (d_hidden, d_weight) = head.backward(&hidden, &d_logits);
        assert_eq!(d_hidden.shape(), &[1, 1, 2]);
        assert_eq!(d_weight.len(), 6);

        // d_weight rows are dy[v] * hidden
        assert_eq!(&d_weight[..2], &[0.5, -0.5]);
        assert_eq!(&d_weight[2..4], &[0.0, 0.0]);
        assert_eq!(&d_weight[4..6], &[-0.25, 0.25]);
    }

    #[test]
    fn test_reinitialize_changes_weights() {
        let mut head = OutputHead::new(8, 16, Some(1));
        let before = head.weight().data().to_vec();

        head.reinitialize(Some(2));
        assert_ne!(head.weight().data(), &before[..]);
        assert_eq!(head.weight().shape(), &[16, 8]);
    }

    #[test]
    fn test_reinitialize_reproducible() {
        let mut a = OutputHead::new(8, 16, Some(1));
        let mut b = OutputHead::new(8, 16, Some(99));
        a.reinitialize(Some(7));
        b.reinitialize(Some(7));
        assert_eq!(a.weight().data(), b.weight().data());
    }
}
