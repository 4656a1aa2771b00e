//! Token and position embedding tables
//!
//! Embeddings are stored as plain weight tensors and looked up by index at
//! the data level, so the tables can be swapped or reinitialized wholesale.

use anyhow::Result;
use aprender::autograd::Tensor;

use crate::init::init_embedding_weight;

/// Learned token embedding table
pub struct TokenEmbedding {
    /// Weight tensor [vocab_size, n_embd]
    weight: Tensor,
    /// Vocabulary size
    vocab_size: usize,
    /// Embedding dimension
    n_embd: usize,
}

impl TokenEmbedding {
    /// Create a new token embedding with random initialization
    pub fn new(vocab_size: usize, n_embd: usize, seed: Option<u64>) -> Self {
        Self {
            weight: init_embedding_weight(vocab_size, n_embd, seed),
            vocab_size,
            n_embd,
        }
    }

    /// Look up embeddings for a batch of token ids
    ///
    /// # Arguments
    /// * `token_ids` - Token ids as f32 tensor [batch, seq_len]
    ///
    /// # Returns
    /// Embedded tensor [batch, seq_len, n_embd]
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let shape = token_ids.shape();
        if shape.len() != 2 {
            anyhow::bail!("Expected 2D token id tensor [batch, seq_len], got {:?}", shape);
        }

        let batch = shape[0];
        let seq_len = shape[1];
        let ids = token_ids.data();
        let weight = self.weight.data();

        let mut output = vec![0.0; batch * seq_len * self.n_embd];
        for (pos, &id) in ids.iter().enumerate() {
            let idx = id as usize;
            if idx >= self.vocab_size {
                anyhow::bail!(
                    "Token id {} out of range for vocabulary size {}",
                    idx,
                    self.vocab_size
                );
            }
            let src = &weight[idx * self.n_embd..(idx + 1) * self.n_embd];
            output[pos * self.n_embd..(pos + 1) * self.n_embd].copy_from_slice(src);
        }

        Ok(Tensor::new(&output, &[batch, seq_len, self.n_embd]))
    }

    /// Backward pass: scatter-add output gradients into table rows
    ///
    /// # Arguments
    /// * `token_ids` - The ids looked up in the forward pass [batch, seq_len]
    /// * `d_output` - Gradient w.r.t. the lookup output [batch, seq_len, n_embd]
    ///
    /// # Returns
    /// Flat gradient buffer for the whole [vocab_size, n_embd] table
    pub fn backward(&self, token_ids: &Tensor, d_output: &Tensor) -> Vec<f32> {
        let ids = token_ids.data();
        let dy = d_output.data();

        let mut d_weight = vec![0.0; self.vocab_size * self.n_embd];
        for (pos, &id) in ids.iter().enumerate() {
            let idx = id as usize;
            let row = &mut d_weight[idx * self.n_embd..(idx + 1) * self.n_embd];
            let src = &dy[pos * self.n_embd..(pos + 1) * self.n_embd];
            for (r, &g) in row.iter_mut().zip(src.iter()) {
                *r += g;
            }
        }
        d_weight
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
    ///
    /// # Errors
    /// Returns an error if the shape does not match [vocab_size, n_embd].
    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.shape() != [self.vocab_size, self.n_embd] {
            anyhow::bail!(
                "Embedding weight shape {:?} does not match [{}, {}]",
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

/// Learned absolute position embedding table
pub struct PositionEmbedding {
    /// Weight tensor [max_len, n_embd]
    weight: Tensor,
    /// Maximum sequence length
    max_len: usize,
    /// Embedding dimension
    n_embd: usize,
}

impl PositionEmbedding {
    /// Create a new position embedding with random initialization
    pub fn new(max_len: usize, n_embd: usize, seed: Option<u64>) -> Self {
        Self {
            weight: init_embedding_weight(max_len, n_embd, seed),
            max_len,
            n_embd,
        }
    }

    /// Position embeddings for the first `seq_len` positions
    ///
    /// # Returns
    /// Tensor [1, seq_len, n_embd], broadcast-added to the token embeddings
    /// by the caller.
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.max_len {
            anyhow::bail!(
                "Sequence length {} exceeds maximum position {}",
                seq_len,
                self.max_len
            );
        }

        let weight = self.weight.data();
        let data = weight[..seq_len * self.n_embd].to_vec();
        Ok(Tensor::new(&data, &[1, seq_len, self.n_embd]))
    }

    /// Backward pass: sum gradients over the batch into the first `seq_len` rows
    ///
    /// # Arguments
    /// * `d_output` - Gradient of the sum of token and position embeddings
    ///   [batch, seq_len, n_embd]; the broadcast add means each position row
    ///   collects gradient from every batch element
    ///
    /// # Returns
    /// Flat gradient buffer for the whole [max_len, n_embd] table
    pub fn backward(&self, d_output: &Tensor) -> Vec<f32> {
        let shape = d_output.shape();
        let (batch, seq_len) = (shape[0], shape[1]);
        let dy = d_output.data();

        let mut d_weight = vec![0.0; self.max_len * self.n_embd];
        for b in 0..batch {
            for s in 0..seq_len {
                let src = &dy[(b * seq_len + s) * self.n_embd..(b * seq_len + s + 1) * self.n_embd];
                let row = &mut d_weight[s * self.n_embd..(s + 1) * self.n_embd];
                for (r, &g) in row.iter_mut().zip(src.iter()) {
                    *r += g;
                }
            }
        }
        d_weight
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
        if weight.shape() != [self.max_len, self.n_embd] {
            anyhow::bail!(
                "Position weight shape {:?} does not match [{}, {}]",
                weight.shape(),
                self.max_len,
                self.n_embd
            );
        }
        self.weight = weight;
        Ok(())
    }
}

/// Add position embeddings [1, seq, n_embd] onto token embeddings [batch, seq, n_embd]
pub fn add_position_embeddings(tokens: &Tensor, positions: &Tensor) -> Tensor {
    let shape = tokens.shape();
    let (batch, seq_len, n_embd) = (shape[0], shape[1], shape[2]);

    let tok = tokens.data();
    let pos = positions.data();
    let mut output = vec![0.0; tok.len()];

    for b in 0..batch {
        for s in 0..seq_len {
            for d in 0..n_embd {
                let idx = b * seq_len * n_embd + s * n_embd + d;
                output[idx] = tok[idx] + pos[s * n_embd + d];
            }
        }
    }

    Tensor::new(&output, shape)
}
