//! Multi-head attention for the encoder-decoder stacks
//!
//! One attention type covers all three uses: bidirectional encoder
//! self-attention, causal decoder self-attention, and decoder cross-attention
//! over the encoder states. Forward and backward are both written at the
//! data level; `forward_with_tape` caches the activations the backward pass
//! needs.

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::projection::Projection;

/// Reshape tensor for attention: [batch, seq, embed] -> [batch, heads, seq, head_dim]
fn reshape_for_attention(
    x: &Tensor,
    batch: usize,
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
) -> Tensor {
    let mut output = vec![0.0; batch * num_heads * seq_len * head_dim];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..num_heads {
                for d in 0..head_dim {
                    let in_idx = b * seq_len * (num_heads * head_dim)
                        + s * (num_heads * head_dim)
                        + h * head_dim
                        + d;
                    let out_idx = b * num_heads * seq_len * head_dim
                        + h * seq_len * head_dim
                        + s * head_dim
                        + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, num_heads, seq_len, head_dim])
}

/// Reshape tensor from attention: [batch, heads, seq, head_dim] -> [batch, seq, embed]
fn reshape_from_attention(x: &Tensor, batch: usize, seq_len: usize, embed_dim: usize) -> Tensor {
    let shape = x.shape();
    let num_heads = shape[1];
    let head_dim = shape[3];
    let mut output = vec![0.0; batch * seq_len * embed_dim];
    let x_data = x.data();

    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..num_heads {
                for d in 0..head_dim {
                    let in_idx = b * num_heads * seq_len * head_dim
                        + h * seq_len * head_dim
                        + s * head_dim
                        + d;
                    let out_idx = b * seq_len * embed_dim + s * embed_dim + h * head_dim + d;
                    output[out_idx] = x_data[in_idx];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, seq_len, embed_dim])
}

/// Transpose last two dimensions
fn transpose_last_two(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let ndim = shape.len();

    if ndim < 2 {
        return x.clone();
    }

    let last = shape[ndim - 1];
    let second_last = shape[ndim - 2];

    let mut new_shape = shape.to_vec();
    new_shape[ndim - 2] = last;
    new_shape[ndim - 1] = second_last;

    let batch_size: usize = shape[..ndim - 2].iter().product();
    let matrix_size = last * second_last;

    let mut output = vec![0.0; x.data().len()];
    let x_data = x.data();

    for b in 0..batch_size {
        let offset = b * matrix_size;
        for i in 0..second_last {
            for j in 0..last {
                output[offset + j * second_last + i] = x_data[offset + i * last + j];
            }
        }
    }

    Tensor::new(&output, &new_shape)
}

/// Batched matrix multiplication for 4D tensors
fn matmul_batched_4d(a: &Tensor, b: &Tensor) -> Tensor {
    let a_shape = a.shape();
    let b_shape = b.shape();

    let (batch, heads, m, k) = (a_shape[0], a_shape[1], a_shape[2], a_shape[3]);
    let n = b_shape[3];

    let mut output = vec![0.0; batch * heads * m * n];
    let a_data = a.data();
    let b_data = b.data();

    for b_idx in 0..batch {
        for h in 0..heads {
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for k_idx in 0..k {
                        let a_idx = b_idx * heads * m * k + h * m * k + i * k + k_idx;
                        let b_idx_off = b_idx * heads * b_shape[2] * n + h * b_shape[2] * n;
                        sum += a_data[a_idx] * b_data[b_idx_off + k_idx * n + j];
                    }
                    output[b_idx * heads * m * n + h * m * n + i * n + j] = sum;
                }
            }
        }
    }

    Tensor::new(&output, &[batch, heads, m, n])
}

/// Scale tensor by a scalar
fn scale_tensor(x: &Tensor, scale: f32) -> Tensor {
    let data: Vec<f32> = x.data().iter().map(|&v| v * scale).collect();
    Tensor::new(&data, x.shape())
}

/// Softmax over last dimension
fn softmax_last_dim(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let last_dim = shape[shape.len() - 1];
    let batch_size: usize = shape[..shape.len() - 1].iter().product();

    let mut output = vec![0.0; x.data().len()];
    let x_data = x.data();

    for b in 0..batch_size {
        let offset = b * last_dim;
        let slice = &x_data[offset..offset + last_dim];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_vals: Vec<f32> = slice.iter().map(|&v| (v - max_val).exp()).collect();
        let sum: f32 = exp_vals.iter().sum();

        for i in 0..last_dim {
            output[offset + i] = if sum > 0.0 { exp_vals[i] / sum } else { 0.0 };
        }
    }

    Tensor::new(&output, shape)
}

/// Backward pass of `softmax_last_dim`
///
/// Given the softmax output p and the gradient dp, each row yields
/// ds_i = p_i * (dp_i - sum_j dp_j p_j). Rows that were fully masked have
/// p = 0 everywhere and produce zero gradient.
fn softmax_backward_last_dim(probs: &Tensor, d_probs: &Tensor) -> Tensor {
    let shape = probs.shape();
    let last_dim = shape[shape.len() - 1];
    let rows: usize = shape[..shape.len() - 1].iter().product();

    let p = probs.data();
    let dp = d_probs.data();
    let mut output = vec![0.0; p.len()];

    for r in 0..rows {
        let offset = r * last_dim;
        let dot: f32 = (0..last_dim)
            .map(|i| dp[offset + i] * p[offset + i])
            .sum();
        for i in 0..last_dim {
            output[offset + i] = p[offset + i] * (dp[offset + i] - dot);
        }
    }

    Tensor::new(&output, shape)
}

/// Build an additive attention mask [batch, q_len, k_len]
///
/// Combines a causal constraint (query positions may not attend to later key
/// positions) with a per-batch key padding mask ([batch, k_len], 1.0 for real
/// tokens, 0.0 for padding). Blocked positions get -inf, open ones 0.0.
pub fn build_attention_mask(
    batch: usize,
    q_len: usize,
    k_len: usize,
    causal: bool,
    key_padding_mask: Option<&Tensor>,
) -> Tensor {
    let mut data = vec![0.0; batch * q_len * k_len];
    let pad = key_padding_mask.map(|m| m.data());

    for b in 0..batch {
        for q in 0..q_len {
            for k in 0..k_len {
                let mut blocked = causal && k > q;
                if let Some(ref pad_data) = pad {
                    if pad_data[b * k_len + k] == 0.0 {
                        blocked = true;
                    }
                }
                if blocked {
                    data[b * q_len * k_len + q * k_len + k] = f32::NEG_INFINITY;
                }
            }
        }
    }

    Tensor::new(&data, &[batch, q_len, k_len])
}

/// Activations cached by `forward_with_tape` for the backward pass
pub(crate) struct AttentionTape {
    /// Query-side input [batch, q_len, n_embd]
    query_input: Tensor,
    /// Key/value-side input [batch, k_len, n_embd]
    kv_input: Tensor,
    /// Per-head queries [batch, heads, q_len, head_dim]
    q: Tensor,
    /// Per-head keys [batch, heads, k_len, head_dim]
    k: Tensor,
    /// Per-head values [batch, heads, k_len, head_dim]
    v: Tensor,
    /// Attention weights after softmax, before dropout
    weights: Tensor,
    /// Inverted dropout mask matching `weights`, when dropout was applied
    dropout_mask: Option<Vec<f32>>,
    /// Concatenated per-head context fed to the output projection
    context: Tensor,
}

/// Multi-head attention layer
///
/// Queries always come from `x`; keys and values come from `x` as well
/// (self-attention) or from a separate key/value source (cross-attention).
pub struct MultiHeadAttention {
    /// Query projection: n_embd -> n_embd
    q_proj: Projection,
    /// Key projection: n_embd -> n_embd
    k_proj: Projection,
    /// Value projection: n_embd -> n_embd
    v_proj: Projection,
    /// Output projection: n_embd -> n_embd
    out_proj: Projection,
    /// Number of attention heads
    n_head: usize,
    /// Head dimension
    head_dim: usize,
    /// Embedding dimension
    n_embd: usize,
    /// Whether queries may only attend to earlier key positions
    causal: bool,
    /// Dropout probability on the attention weights (None = disabled)
    dropout_p: Option<f32>,
    /// Dropout mask generator, present only when dropout is enabled
    rng: Option<StdRng>,
}

impl MultiHeadAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    /// * `n_embd` - Embedding dimension
    /// * `n_head` - Number of attention heads
    /// * `causal` - Apply a causal mask (decoder self-attention)
    /// * `dropout_p` - Dropout probability (None or 0.0 = no dropout)
    /// * `seed` - Optional seed; the four projections draw from `seed` through
    ///   `seed + 3` and the dropout mask generator from `seed + 4`
    pub fn new(
        n_embd: usize,
        n_head: usize,
        causal: bool,
        dropout_p: Option<f32>,
        seed: Option<u64>,
    ) -> Self {
        let head_dim = n_embd / n_head;

        let dropout_p = dropout_p.filter(|&p| p > 0.0);
        let rng = dropout_p.map(|_| match seed {
            Some(s) => StdRng::seed_from_u64(s + 4),
            None => StdRng::from_entropy(),
        });

        Self {
            q_proj: Projection::new(n_embd, n_embd, seed),
            k_proj: Projection::new(n_embd, n_embd, seed.map(|s| s + 1)),
            v_proj: Projection::new(n_embd, n_embd, seed.map(|s| s + 2)),
            out_proj: Projection::new(n_embd, n_embd, seed.map(|s| s + 3)),
            n_head,
            head_dim,
            n_embd,
            causal,
            dropout_p,
            rng,
        }
    }

    /// Forward pass without dropout (evaluation path)
    ///
    /// # Arguments
    /// * `x` - Query input [batch, q_len, n_embd]
    /// * `kv_source` - Key/value input for cross-attention (None = self-attention)
    /// * `key_padding_mask` - Optional [batch, k_len] mask, 1.0 real / 0.0 padding
    ///
    /// # Returns
    /// Output tensor [batch, q_len, n_embd]
    pub fn forward(
        &self,
        x: &Tensor,
        kv_source: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (out, _) = self.run(x, kv_source, key_padding_mask, None)?;
        Ok(out)
    }

    /// Training forward pass caching activations for `backward`
    ///
    /// Applies attention-weight dropout when the layer was built with a
    /// dropout probability.
    pub(crate) fn forward_with_tape(
        &mut self,
        x: &Tensor,
        kv_source: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
    ) -> Result<(Tensor, AttentionTape)> {
        let mut rng = self.rng.take();
        let result = self.run(x, kv_source, key_padding_mask, rng.as_mut());
        self.rng = rng;
        result
    }

    fn run(
        &self,
        x: &Tensor,
        kv_source: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, AttentionTape)> {
        let shape = x.shape();
        if shape.len() != 3 {
            anyhow::bail!(
                "Expected 3D tensor [batch, seq_len, n_embd], got shape {:?}",
                shape
            );
        }

        let batch_size = shape[0];
        let q_len = shape[1];

        let kv = kv_source.unwrap_or(x);
        let k_len = kv.shape()[1];

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(kv)?;
        let v = self.v_proj.forward(kv)?;

        let q = reshape_for_attention(&q, batch_size, q_len, self.n_head, self.head_dim);
        let k = reshape_for_attention(&k, batch_size, k_len, self.n_head, self.head_dim);
        let v = reshape_for_attention(&v, batch_size, k_len, self.n_head, self.head_dim);

        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let key_t = transpose_last_two(&k);
        let scores = scale_tensor(&matmul_batched_4d(&q, &key_t), scale);

        let needs_mask = self.causal || key_padding_mask.is_some();
        let scores = if needs_mask {
            let mask = build_attention_mask(batch_size, q_len, k_len, self.causal, key_padding_mask);
            let mask_data = mask.data();
            let mut masked = scores.data().to_vec();
            for b in 0..batch_size {
                for h in 0..self.n_head {
                    for qi in 0..q_len {
                        for ki in 0..k_len {
                            let idx = b * self.n_head * q_len * k_len
                                + h * q_len * k_len
                                + qi * k_len
                                + ki;
                            masked[idx] += mask_data[b * q_len * k_len + qi * k_len + ki];
                        }
                    }
                }
            }
            Tensor::new(&masked, scores.shape())
        } else {
            scores
        };

        let weights = softmax_last_dim(&scores);

        let (weights_used, dropout_mask) = match (self.dropout_p, dropout_rng.as_deref_mut()) {
            (Some(p), Some(rng)) => {
                let keep = 1.0 - p;
                let mask: Vec<f32> = (0..weights.data().len())
                    .map(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
                    .collect();
                let dropped: Vec<f32> = weights
                    .data()
                    .iter()
                    .zip(mask.iter())
                    .map(|(&w, &m)| w * m)
                    .collect();
                (Tensor::new(&dropped, weights.shape()), Some(mask))
            }
            _ => (weights.clone(), None),
        };

        let context4 = matmul_batched_4d(&weights_used, &v);
        let context = reshape_from_attention(&context4, batch_size, q_len, self.n_embd);
        let out = self.out_proj.forward(&context)?;

        let tape = AttentionTape {
            query_input: x.clone(),
            kv_input: kv.clone(),
            q,
            k,
            v,
            weights,
            dropout_mask,
            context,
        };
        Ok((out, tape))
    }

    /// Backward pass
    ///
    /// # Returns
    /// (gradient w.r.t. the query input, gradient w.r.t. the key/value input,
    /// parameter gradients in the `parameters()` order
    /// [q_weight, q_bias, k_weight, k_bias, v_weight, v_bias, out_weight, out_bias]).
    ///
    /// For self-attention the caller adds the two input gradients together.
    pub(crate) fn backward(
        &self,
        tape: &AttentionTape,
        d_output: &Tensor,
    ) -> (Tensor, Tensor, Vec<Vec<f32>>) {
        let batch = tape.query_input.shape()[0];
        let q_len = tape.query_input.shape()[1];
        let k_len = tape.kv_input.shape()[1];
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        let (d_context, d_out_w, d_out_b) = self.out_proj.backward(&tape.context, d_output);
        let d_context4 =
            reshape_for_attention(&d_context, batch, q_len, self.n_head, self.head_dim);

        // Reapply the dropout mask to recover the weights the context used
        let weights_used = match &tape.dropout_mask {
            Some(mask) => {
                let dropped: Vec<f32> = tape
                    .weights
                    .data()
                    .iter()
                    .zip(mask.iter())
                    .map(|(&w, &m)| w * m)
                    .collect();
                Tensor::new(&dropped, tape.weights.shape())
            }
            None => tape.weights.clone(),
        };

        // context = weights_used @ v
        let d_weights_used = matmul_batched_4d(&d_context4, &transpose_last_two(&tape.v));
        let d_v = matmul_batched_4d(&transpose_last_two(&weights_used), &d_context4);

        let d_weights = match &tape.dropout_mask {
            Some(mask) => {
                let data: Vec<f32> = d_weights_used
                    .data()
                    .iter()
                    .zip(mask.iter())
                    .map(|(&g, &m)| g * m)
                    .collect();
                Tensor::new(&data, d_weights_used.shape())
            }
            None => d_weights_used,
        };

        // weights = softmax(scores); the additive mask is constant
        let d_scores = softmax_backward_last_dim(&tape.weights, &d_weights);
        let d_scores = scale_tensor(&d_scores, scale);

        // scores (pre-scale) = q @ k^T
        let d_q4 = matmul_batched_4d(&d_scores, &tape.k);
        let d_k4 = matmul_batched_4d(&transpose_last_two(&d_scores), &tape.q);

        let d_q = reshape_from_attention(&d_q4, batch, q_len, self.n_embd);
        let d_k = reshape_from_attention(&d_k4, batch, k_len, self.n_embd);
        let d_v3 = reshape_from_attention(&d_v, batch, k_len, self.n_embd);

        let (d_query_input, d_q_w, d_q_b) = self.q_proj.backward(&tape.query_input, &d_q);
        let (d_kv_from_k, d_k_w, d_k_b) = self.k_proj.backward(&tape.kv_input, &d_k);
        let (d_kv_from_v, d_v_w, d_v_b) = self.v_proj.backward(&tape.kv_input, &d_v3);

        let d_kv_input = d_kv_from_k.add(&d_kv_from_v);

        (
            d_query_input,
            d_kv_input,
            vec![d_q_w, d_q_b, d_k_w, d_k_b, d_v_w, d_v_b, d_out_w, d_out_b],
        )
    }

    /// Get the number of attention heads
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Get the head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

impl Module for MultiHeadAttention {
    /// Serialization shim: `save_model`/`load_model` walk the model through
    /// the `Module` impl; the training pipeline never calls this forward.
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward(input, None, None).expect("Attention forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters());
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters_mut());
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params
    }
}
