//! Encoder-decoder sequence-to-sequence model
//!
//! The model owns a trainability set keyed by dotted parameter name prefixes.
//! Freezing never touches the tensors themselves; the training loop steps
//! its optimizer over `trainable_named_parameters_mut()` so frozen weights
//! simply never receive updates.

use std::collections::BTreeSet;

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;

use crate::config::Seq2SeqConfig;
use crate::decoder::Decoder;
use crate::embedding::{add_position_embeddings, PositionEmbedding, TokenEmbedding};
use crate::encoder::Encoder;
use crate::grad::Gradients;
use crate::head::OutputHead;
use crate::loss::{cross_entropy_loss, cross_entropy_loss_with_grad};

/// Encoder-decoder transformer with a detachable output head
pub struct Seq2Seq {
    config: Seq2SeqConfig,
    /// Token embedding shared between encoder and decoder inputs
    token_embedding: TokenEmbedding,
    /// Position table for the source side
    src_pos: PositionEmbedding,
    /// Position table for the target side
    tgt_pos: PositionEmbedding,
    /// Encoder stack
    pub encoder: Encoder,
    /// Decoder stack
    pub decoder: Decoder,
    /// Vocabulary projection
    pub lm_head: OutputHead,
    /// Dotted name prefixes whose parameters receive gradient updates
    trainable: BTreeSet<String>,
}

impl Seq2Seq {
    /// Create a new model with random weights, fully trainable
    pub fn new(config: Seq2SeqConfig) -> Self {
        let token_embedding =
            TokenEmbedding::new(config.vocab_size, config.n_embd, config.seed);
        let src_pos =
            PositionEmbedding::new(config.max_source_len, config.n_embd, config.seed.map(|s| s + 1));
        let tgt_pos =
            PositionEmbedding::new(config.max_target_len, config.n_embd, config.seed.map(|s| s + 2));
        let encoder = Encoder::new(&config);
        let decoder = Decoder::new(&config);
        let lm_head = OutputHead::new(config.n_embd, config.vocab_size, config.seed.map(|s| s + 3));

        let mut model = Self {
            config,
            token_embedding,
            src_pos,
            tgt_pos,
            encoder,
            decoder,
            lm_head,
            trainable: BTreeSet::new(),
        };
        model.trainable.insert(String::new());
        model
    }

    /// Model configuration
    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    /// Throw away the output head weights and draw fresh ones
    pub fn reinitialize_head(&mut self, seed: Option<u64>) {
        self.lm_head.reinitialize(seed);
    }

    // ---- trainability --------------------------------------------------

    /// Mark every parameter as frozen
    pub fn freeze_all(&mut self) {
        self.trainable.clear();
    }

    /// Mark all parameters under a dotted name prefix as trainable
    ///
    /// Idempotent; unfreezing an already-trainable prefix is a no-op.
    pub fn unfreeze_prefix(&mut self, prefix: &str) {
        self.trainable.insert(prefix.to_string());
    }

    /// Whether a parameter name falls under a trainable prefix
    ///
    /// A prefix matches the whole name or a dotted ancestor of it; the empty
    /// prefix matches everything.
    pub fn is_trainable(&self, name: &str) -> bool {
        prefix_set_matches(&self.trainable, name)
    }

    /// Currently trainable prefixes, sorted
    pub fn trainable_prefixes(&self) -> Vec<String> {
        self.trainable.iter().cloned().collect()
    }

    // ---- parameter enumeration -----------------------------------------

    /// All parameters with stable dotted names
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut out: Vec<(String, &Tensor)> = Vec::new();
        out.push(("embedding.token".to_string(), self.token_embedding.weight()));
        out.push(("embedding.src_pos".to_string(), self.src_pos.weight()));
        out.push(("embedding.tgt_pos".to_string(), self.tgt_pos.weight()));
        for (i, block) in self.encoder.blocks.iter().enumerate() {
            block.collect_parameters(&format!("encoder.blocks.{i}"), &mut out);
        }
        for (i, block) in self.decoder.blocks.iter().enumerate() {
            block.collect_parameters(&format!("decoder.blocks.{i}"), &mut out);
        }
        out.push(("lm_head.weight".to_string(), self.lm_head.weight()));
        out
    }

    /// All parameters with stable dotted names, mutable
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out: Vec<(String, &mut Tensor)> = Vec::new();
        out.push((
            "embedding.token".to_string(),
            self.token_embedding.weight_mut(),
        ));
        out.push(("embedding.src_pos".to_string(), self.src_pos.weight_mut()));
        out.push(("embedding.tgt_pos".to_string(), self.tgt_pos.weight_mut()));
        for (i, block) in self.encoder.blocks.iter_mut().enumerate() {
            block.collect_parameters_mut(&format!("encoder.blocks.{i}"), &mut out);
        }
        for (i, block) in self.decoder.blocks.iter_mut().enumerate() {
            block.collect_parameters_mut(&format!("decoder.blocks.{i}"), &mut out);
        }
        out.push(("lm_head.weight".to_string(), self.lm_head.weight_mut()));
        out
    }

    /// Mutable references to the trainable parameters only
    pub fn trainable_parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.trainable_named_parameters_mut()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    /// Trainable parameters with their dotted names, mutable
    ///
    /// This is the set handed to the optimizer; gradient lookups go through
    /// the names.
    pub fn trainable_named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let trainable = self.trainable.clone();
        self.named_parameters_mut()
            .into_iter()
            .filter(|(name, _)| prefix_set_matches(&trainable, name))
            .collect()
    }

    /// Total parameter count
    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, p)| p.data().len())
            .sum()
    }

    /// Trainable parameter count
    pub fn num_trainable_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .filter(|(name, _)| self.is_trainable(name))
            .map(|(_, p)| p.data().len())
            .sum()
    }

    // ---- forward -------------------------------------------------------

    /// Shift labels right to form decoder input
    ///
    /// Prepends `decoder_start_token_id` and drops the final position, so the
    /// decoder at step t sees targets[..t].
    ///
    /// # Arguments
    /// * `labels` - Target ids as f32 tensor [batch, tgt_len]
    pub fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        let shape = labels.shape();
        if shape.len() != 2 {
            anyhow::bail!("Expected 2D label tensor [batch, tgt_len], got {:?}", shape);
        }
        let (batch, tgt_len) = (shape[0], shape[1]);
        let data = labels.data();

        let mut shifted = vec![0.0; batch * tgt_len];
        for b in 0..batch {
            shifted[b * tgt_len] = self.config.decoder_start_token_id as f32;
            for t in 1..tgt_len {
                shifted[b * tgt_len + t] = data[b * tgt_len + t - 1];
            }
        }

        Ok(Tensor::new(&shifted, &[batch, tgt_len]))
    }

    /// Run the encoder over embedded source ids
    ///
    /// # Arguments
    /// * `input_ids` - Source ids as f32 tensor [batch, src_len]
    /// * `attention_mask` - Source padding mask [batch, src_len], 1.0 real / 0.0 pad
    pub fn encode(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let src_len = input_ids.shape()[1];
        if src_len > self.config.max_source_len {
            anyhow::bail!(
                "Source length {} exceeds maximum {}",
                src_len,
                self.config.max_source_len
            );
        }

        let tokens = self.token_embedding.forward(input_ids)?;
        let positions = self.src_pos.forward(src_len)?;
        let x = add_position_embeddings(&tokens, &positions);
        self.encoder.forward(&x, attention_mask)
    }

    /// Full training forward pass returning the scalar loss
    ///
    /// # Arguments
    /// * `input_ids` - Source ids as f32 tensor [batch, src_len]
    /// * `attention_mask` - Source padding mask [batch, src_len]
    /// * `labels` - Target ids as f32 tensor [batch, tgt_len]; padding
    ///   positions hold `pad_token_id` and are excluded from the loss
    pub fn forward_training(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: &Tensor,
    ) -> Result<Tensor> {
        let tgt_len = labels.shape()[1];
        if tgt_len > self.config.max_target_len {
            anyhow::bail!(
                "Target length {} exceeds maximum {}",
                tgt_len,
                self.config.max_target_len
            );
        }

        let memory = self.encode(input_ids, attention_mask)?;

        let decoder_input = self.shift_right(labels)?;
        let tokens = self.token_embedding.forward(&decoder_input)?;
        let positions = self.tgt_pos.forward(tgt_len)?;
        let x = add_position_embeddings(&tokens, &positions);

        let hidden = self.decoder.forward(&x, &memory, attention_mask)?;
        let logits = self.lm_head.forward(&hidden)?;

        cross_entropy_loss(&logits, labels, self.config.pad_token_id)
    }

    /// Training step: forward pass plus explicit backward pass
    ///
    /// Runs the same computation as `forward_training` (with attention
    /// dropout, when configured) while caching activations, then
    /// backpropagates the cross-entropy gradient through every layer.
    /// Gradients come back keyed by the `named_parameters()` dotted names;
    /// the shared token table accumulates from both the encoder and decoder
    /// lookups.
    ///
    /// # Arguments
    /// * `input_ids` - Source ids as f32 tensor [batch, src_len]
    /// * `attention_mask` - Source padding mask [batch, src_len]
    /// * `labels` - Target ids as f32 tensor [batch, tgt_len]
    ///
    /// # Returns
    /// (scalar loss value, gradients for every parameter)
    pub fn forward_backward(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: &Tensor,
    ) -> Result<(f32, Gradients)> {
        let src_len = input_ids.shape()[1];
        if src_len > self.config.max_source_len {
            anyhow::bail!(
                "Source length {} exceeds maximum {}",
                src_len,
                self.config.max_source_len
            );
        }
        let tgt_len = labels.shape()[1];
        if tgt_len > self.config.max_target_len {
            anyhow::bail!(
                "Target length {} exceeds maximum {}",
                tgt_len,
                self.config.max_target_len
            );
        }

        // Encoder forward
        let src_tokens = self.token_embedding.forward(input_ids)?;
        let src_positions = self.src_pos.forward(src_len)?;
        let enc_input = add_position_embeddings(&src_tokens, &src_positions);
        let (memory, enc_tape) = self.encoder.forward_with_tape(&enc_input, attention_mask)?;

        // Decoder forward
        let decoder_input = self.shift_right(labels)?;
        let tgt_tokens = self.token_embedding.forward(&decoder_input)?;
        let tgt_positions = self.tgt_pos.forward(tgt_len)?;
        let dec_input = add_position_embeddings(&tgt_tokens, &tgt_positions);
        let (hidden, dec_tape) =
            self.decoder
                .forward_with_tape(&dec_input, &memory, attention_mask)?;

        let logits = self.lm_head.forward(&hidden)?;
        let (loss, d_logits) =
            cross_entropy_loss_with_grad(&logits, labels, self.config.pad_token_id)?;

        // Backward
        let mut grads = Gradients::new();

        let (d_hidden, d_head_weight) = self.lm_head.backward(&hidden, &d_logits);
        grads.accumulate("lm_head.weight", d_head_weight);

        let (d_dec_input, d_memory) = self.decoder.backward(&dec_tape, &d_hidden, &mut grads);
        grads.accumulate("embedding.tgt_pos", self.tgt_pos.backward(&d_dec_input));
        grads.accumulate(
            "embedding.token",
            self.token_embedding.backward(&decoder_input, &d_dec_input),
        );

        let d_enc_input = self.encoder.backward(&enc_tape, &d_memory, &mut grads);
        grads.accumulate("embedding.src_pos", self.src_pos.backward(&d_enc_input));
        grads.accumulate(
            "embedding.token",
            self.token_embedding.backward(input_ids, &d_enc_input),
        );

        Ok((loss, grads))
    }
}

/// Whether `name` equals a prefix in `set` or falls under one dotted ancestor
///
/// The empty prefix matches everything.
fn prefix_set_matches(set: &BTreeSet<String>, name: &str) -> bool {
    set.iter().any(|prefix| {
        prefix.is_empty()
            || name == prefix
            || (name.starts_with(prefix.as_str())
                && name.as_bytes().get(prefix.len()) == Some(&b'.'))
    })
}

impl Module for Seq2Seq {
    /// Serialization shim: `save_model`/`load_model` walk the model through
    /// the `Module` impl; the training pipeline never calls this forward.
    fn forward(&self, input: &Tensor) -> Tensor {
        self.encode(input, None).expect("Seq2Seq forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.named_parameters_mut()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }
}
