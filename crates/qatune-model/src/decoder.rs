//! Transformer decoder stack with cross-attention

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;

use crate::attention::{AttentionTape, MultiHeadAttention};
use crate::config::Seq2SeqConfig;
use crate::grad::Gradients;
use crate::mlp::{FeedForward, FeedForwardTape};
use crate::norm::{rms_norm, rms_norm_backward};

/// Decoder block
///
/// Architecture:
/// - Pre-norm causal self-attention: x = x + attn(norm(x))
/// - Pre-norm cross-attention over encoder states: x = x + xattn(norm(x), memory)
/// - Pre-norm feed-forward: x = x + ffn(norm(x))
pub struct DecoderBlock {
    /// Causal self-attention over the target sequence
    self_attn: MultiHeadAttention,
    /// Cross-attention over the encoder output
    cross_attn: MultiHeadAttention,
    /// Feed-forward layer
    ffn: FeedForward,
}

/// Activations cached by a block's training forward pass
pub(crate) struct DecoderBlockTape {
    /// Block input
    x: Tensor,
    /// Residual state after the self-attention sub-layer
    x1: Tensor,
    /// Residual state after the cross-attention sub-layer
    x2: Tensor,
    self_attn: AttentionTape,
    cross_attn: AttentionTape,
    ffn: FeedForwardTape,
}

impl DecoderBlock {
    /// Create a new decoder block
    ///
    /// Each block draws its weights from a disjoint seed range so that
    /// construction is deterministic for a given `Seq2SeqConfig::seed`.
    pub fn new(config: &Seq2SeqConfig, layer_idx: usize) -> Self {
        let base = config.seed.map(|s| s + 10_000 + 20 * layer_idx as u64);
        Self {
            self_attn: MultiHeadAttention::new(
                config.n_embd,
                config.n_head,
                true,
                config.dropout,
                base,
            ),
            cross_attn: MultiHeadAttention::new(
                config.n_embd,
                config.n_head,
                false,
                config.dropout,
                base.map(|s| s + 5),
            ),
            ffn: FeedForward::new(config.n_embd, base.map(|s| s + 10)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Embedded target prefix [batch, tgt_len, n_embd]
    /// * `memory` - Encoder hidden states [batch, src_len, n_embd]
    /// * `memory_padding_mask` - Source padding mask [batch, src_len]
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        memory_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x_norm = rms_norm(x)?;
        let attn_out = self.self_attn.forward(&x_norm, None, None)?;

        if attn_out.shape() != x.shape() {
            anyhow::bail!(
                "Self-attention output shape {:?} doesn't match input shape {:?}",
                attn_out.shape(),
                x.shape()
            );
        }
        let x = attn_out.add(x);

        let x_norm = rms_norm(&x)?;
        let cross_out = self
            .cross_attn
            .forward(&x_norm, Some(memory), memory_padding_mask)?;
        let x = cross_out.add(&x);

        let x_norm = rms_norm(&x)?;
        let ffn_out = self.ffn.forward(&x_norm)?;
        Ok(ffn_out.add(&x))
    }

    /// Training forward pass caching activations for `backward`
    pub(crate) fn forward_with_tape(
        &mut self,
        x: &Tensor,
        memory: &Tensor,
        memory_padding_mask: Option<&Tensor>,
    ) -> Result<(Tensor, DecoderBlockTape)> {
        let x_norm = rms_norm(x)?;
        let (attn_out, self_tape) = self.self_attn.forward_with_tape(&x_norm, None, None)?;
        let x1 = attn_out.add(x);

        let x1_norm = rms_norm(&x1)?;
        let (cross_out, cross_tape) =
            self.cross_attn
                .forward_with_tape(&x1_norm, Some(memory), memory_padding_mask)?;
        let x2 = cross_out.add(&x1);

        let x2_norm = rms_norm(&x2)?;
        let (ffn_out, ffn_tape) = self.ffn.forward_with_tape(&x2_norm)?;
        let out = ffn_out.add(&x2);

        Ok((
            out,
            DecoderBlockTape {
                x: x.clone(),
                x1,
                x2,
                self_attn: self_tape,
                cross_attn: cross_tape,
                ffn: ffn_tape,
            },
        ))
    }

    /// Backward pass, accumulating parameter gradients under `prefix`
    ///
    /// # Returns
    /// (gradient w.r.t. the block input, gradient w.r.t. the encoder memory)
    pub(crate) fn backward(
        &self,
        tape: &DecoderBlockTape,
        d_output: &Tensor,
        prefix: &str,
        grads: &mut Gradients,
    ) -> (Tensor, Tensor) {
        // out = x2 + ffn(norm(x2))
        let (d_x2_norm, ffn_grads) = self.ffn.backward(&tape.ffn, d_output);
        let d_x2 = d_output.add(&rms_norm_backward(&tape.x2, &d_x2_norm));

        // x2 = x1 + cross(norm(x1), memory)
        let (d_x1_norm, d_memory, cross_grads) = self.cross_attn.backward(&tape.cross_attn, &d_x2);
        let d_x1 = d_x2.add(&rms_norm_backward(&tape.x1, &d_x1_norm));

        // x1 = x + self(norm(x))
        let (d_q_norm, d_kv_norm, self_grads) = self.self_attn.backward(&tape.self_attn, &d_x1);
        let d_x_norm = d_q_norm.add(&d_kv_norm);
        let d_x = d_x1.add(&rms_norm_backward(&tape.x, &d_x_norm));

        for (i, g) in self_grads.into_iter().enumerate() {
            grads.accumulate(&format!("{prefix}.self_attn.{i}"), g);
        }
        for (i, g) in cross_grads.into_iter().enumerate() {
            grads.accumulate(&format!("{prefix}.cross_attn.{i}"), g);
        }
        for (i, g) in ffn_grads.into_iter().enumerate() {
            grads.accumulate(&format!("{prefix}.ffn.{i}"), g);
        }

        (d_x, d_memory)
    }

    /// Collect parameters with dotted names under `prefix`
    pub(crate) fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Tensor)>,
    ) {
        for (i, p) in self.self_attn.parameters_mut().into_iter().enumerate() {
            out.push((format!("{prefix}.self_attn.{i}"), p));
        }
        for (i, p) in self.cross_attn.parameters_mut().into_iter().enumerate() {
            out.push((format!("{prefix}.cross_attn.{i}"), p));
        }
        for (i, p) in self.ffn.parameters_mut().into_iter().enumerate() {
            out.push((format!("{prefix}.ffn.{i}"), p));
        }
    }

    /// Collect shared parameter references with dotted names under `prefix`
    pub(crate) fn collect_parameters<'a>(
        &'a self,
        prefix: &str,
        out: &mut Vec<(String, &'a Tensor)>,
    ) {
        for (i, p) in self.self_attn.parameters().into_iter().enumerate() {
            out.push((format!("{prefix}.self_attn.{i}"), p));
        }
        for (i, p) in self.cross_attn.parameters().into_iter().enumerate() {
            out.push((format!("{prefix}.cross_attn.{i}"), p));
        }
        for (i, p) in self.ffn.parameters().into_iter().enumerate() {
            out.push((format!("{prefix}.ffn.{i}"), p));
        }
    }
}

/// Activations cached by the stack's training forward pass
pub(crate) struct DecoderTape {
    blocks: Vec<DecoderBlockTape>,
    /// Input to the final RMSNorm
    pre_norm: Tensor,
}

/// Decoder stack
pub struct Decoder {
    /// Decoder blocks in order; the freeze policy addresses these by index
    pub blocks: Vec<DecoderBlock>,
}

impl Decoder {
    /// Create a new decoder from configuration
    pub fn new(config: &Seq2SeqConfig) -> Self {
        let blocks = (0..config.n_decoder_layer)
            .map(|i| DecoderBlock::new(config, i))
            .collect();
        Self { blocks }
    }

    /// Decode a batch of embedded target prefixes against encoder states
    ///
    /// # Returns
    /// Decoder hidden states [batch, tgt_len, n_embd]
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        memory_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x, memory, memory_padding_mask)?;
        }
        rms_norm(&x)
    }

    /// Training forward pass caching activations for `backward`
    pub(crate) fn forward_with_tape(
        &mut self,
        x: &Tensor,
        memory: &Tensor,
        memory_padding_mask: Option<&Tensor>,
    ) -> Result<(Tensor, DecoderTape)> {
        let mut x = x.clone();
        let mut tapes = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            let (out, tape) = block.forward_with_tape(&x, memory, memory_padding_mask)?;
            tapes.push(tape);
            x = out;
        }
        let out = rms_norm(&x)?;
        Ok((
            out,
            DecoderTape {
                blocks: tapes,
                pre_norm: x,
            },
        ))
    }

    /// Backward pass through the final norm and all blocks in reverse
    ///
    /// Every block cross-attends to the same memory, so the memory gradients
    /// from all blocks are summed.
    ///
    /// # Returns
    /// (gradient w.r.t. the embedded target input, gradient w.r.t. the memory)
    pub(crate) fn backward(
        &self,
        tape: &DecoderTape,
        d_output: &Tensor,
        grads: &mut Gradients,
    ) -> (Tensor, Tensor) {
        let mut d = rms_norm_backward(&tape.pre_norm, d_output);
        let mut d_memory: Option<Tensor> = None;

        for (i, block) in self.blocks.iter().enumerate().rev() {
            let (d_x, d_mem) =
                block.backward(&tape.blocks[i], &d, &format!("decoder.blocks.{i}"), grads);
            d = d_x;
            d_memory = Some(match d_memory {
                Some(total) => total.add(&d_mem),
                None => d_mem,
            });
        }

        let d_memory = d_memory.unwrap_or_else(|| Tensor::zeros(d.shape()));
        (d, d_memory)
    }
}
