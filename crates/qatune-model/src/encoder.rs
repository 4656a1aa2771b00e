//! Transformer encoder stack

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;

use crate::attention::{AttentionTape, MultiHeadAttention};
use crate::config::Seq2SeqConfig;
use crate::grad::Gradients;
use crate::mlp::{FeedForward, FeedForwardTape};
use crate::norm::{rms_norm, rms_norm_backward};

/// Bidirectional encoder block
///
/// Architecture:
/// - Pre-norm self-attention: x = x + attn(norm(x))
/// - Pre-norm feed-forward: x = x + ffn(norm(x))
pub struct EncoderBlock {
    /// Bidirectional self-attention
    self_attn: MultiHeadAttention,
    /// Feed-forward layer
    ffn: FeedForward,
}

/// Activations cached by a block's training forward pass
pub(crate) struct EncoderBlockTape {
    /// Block input
    x: Tensor,
    /// Residual state after the attention sub-layer
    x1: Tensor,
    attn: AttentionTape,
    ffn: FeedForwardTape,
}

impl EncoderBlock {
    /// Create a new encoder block
    ///
    /// Each block draws its weights from a disjoint seed range so that
    /// construction is deterministic for a given `Seq2SeqConfig::seed`.
    pub fn new(config: &Seq2SeqConfig, layer_idx: usize) -> Self {
        let base = config.seed.map(|s| s + 1_000 + 10 * layer_idx as u64);
        Self {
            self_attn: MultiHeadAttention::new(
                config.n_embd,
                config.n_head,
                false,
                config.dropout,
                base,
            ),
            ffn: FeedForward::new(config.n_embd, base.map(|s| s + 5)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    /// * `padding_mask` - Source padding mask [batch, seq_len], 1.0 real / 0.0 pad
    pub fn forward(&self, x: &Tensor, padding_mask: Option<&Tensor>) -> Result<Tensor> {
        let x_norm = rms_norm(x)?;
        let attn_out = self.self_attn.forward(&x_norm, None, padding_mask)?;

        if attn_out.shape() != x.shape() {
            anyhow::bail!(
                "Attention output shape {:?} doesn't match input shape {:?}",
                attn_out.shape(),
                x.shape()
            );
        }
        let x = attn_out.add(x);

        let x_norm = rms_norm(&x)?;
        let ffn_out = self.ffn.forward(&x_norm)?;
        Ok(ffn_out.add(&x))
    }

    /// Training forward pass caching activations for `backward`
    pub(crate) fn forward_with_tape(
        &mut self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> Result<(Tensor, EncoderBlockTape)> {
        let x_norm = rms_norm(x)?;
        let (attn_out, attn_tape) = self.self_attn.forward_with_tape(&x_norm, None, padding_mask)?;
        let x1 = attn_out.add(x);

        let x1_norm = rms_norm(&x1)?;
        let (ffn_out, ffn_tape) = self.ffn.forward_with_tape(&x1_norm)?;
        let out = ffn_out.add(&x1);

        Ok((
            out,
            EncoderBlockTape {
                x: x.clone(),
                x1,
                attn: attn_tape,
                ffn: ffn_tape,
            },
        ))
    }

    /// Backward pass, accumulating parameter gradients under `prefix`
    ///
    /// # Returns
    /// Gradient w.r.t. the block input
    pub(crate) fn backward(
        &self,
        tape: &EncoderBlockTape,
        d_output: &Tensor,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        // out = x1 + ffn(norm(x1))
        let (d_x1_norm, ffn_grads) = self.ffn.backward(&tape.ffn, d_output);
        let d_x1 = d_output.add(&rms_norm_backward(&tape.x1, &d_x1_norm));

        // x1 = x + attn(norm(x))
        let (d_q_norm, d_kv_norm, attn_grads) = self.self_attn.backward(&tape.attn, &d_x1);
        let d_x_norm = d_q_norm.add(&d_kv_norm);
        let d_x = d_x1.add(&rms_norm_backward(&tape.x, &d_x_norm));

        for (i, g) in attn_grads.into_iter().enumerate() {
            grads.accumulate(&format!("{prefix}.self_attn.{i}"), g);
        }
        for (i, g) in ffn_grads.into_iter().enumerate() {
            grads.accumulate(&format!("{prefix}.ffn.{i}"), g);
        }

        d_x
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
        for (i, p) in self.ffn.parameters().into_iter().enumerate() {
            out.push((format!("{prefix}.ffn.{i}"), p));
        }
    }
}

/// Activations cached by the stack's training forward pass
pub(crate) struct EncoderTape {
    blocks: Vec<EncoderBlockTape>,
    /// Input to the final RMSNorm
    pre_norm: Tensor,
}

/// Encoder stack
pub struct Encoder {
    /// Encoder blocks in order
    pub blocks: Vec<EncoderBlock>,
}

impl Encoder {
    /// Create a new encoder from configuration
    pub fn new(config: &Seq2SeqConfig) -> Self {
        let blocks = (0..config.n_encoder_layer)
            .map(|i| EncoderBlock::new(config, i))
            .collect();
        Self { blocks }
    }

    /// Encode a batch of embedded source sequences
    ///
    /// # Arguments
    /// * `x` - Embedded source [batch, src_len, n_embd]
    /// * `padding_mask` - Source padding mask [batch, src_len]
    ///
    /// # Returns
    /// Encoder hidden states [batch, src_len, n_embd]
    pub fn forward(&self, x: &Tensor, padding_mask: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x, padding_mask)?;
        }
        rms_norm(&x)
    }

    /// Training forward pass caching activations for `backward`
    pub(crate) fn forward_with_tape(
        &mut self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> Result<(Tensor, EncoderTape)> {
        let mut x = x.clone();
        let mut tapes = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            let (out, tape) = block.forward_with_tape(&x, padding_mask)?;
            tapes.push(tape);
            x = out;
        }
        let out = rms_norm(&x)?;
        Ok((
            out,
            EncoderTape {
                blocks: tapes,
                pre_norm: x,
            },
        ))
    }

    /// Backward pass through the final norm and all blocks in reverse
    ///
    /// # Returns
    /// Gradient w.r.t. the embedded source input
    pub(crate) fn backward(
        &self,
        tape: &EncoderTape,
        d_output: &Tensor,
        grads: &mut Gradients,
    ) -> Tensor {
        let mut d = rms_norm_backward(&tape.pre_norm, d_output);
        for (i, block) in self.blocks.iter().enumerate().rev() {
            d = block.backward(&tape.blocks[i], &d, &format!("encoder.blocks.{i}"), grads);
        }
        d
    }
}
