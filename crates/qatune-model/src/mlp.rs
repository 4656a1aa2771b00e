//! Feed-forward network with ReLU² activation

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;

use crate::projection::Projection;

/// Position-wise feed-forward layer
///
/// Architecture:
/// - Expansion: n_embd -> 4 * n_embd
/// - Activation: ReLU² (relu(x) squared)
/// - Projection: 4 * n_embd -> n_embd
pub struct FeedForward {
    /// Expansion layer: n_embd -> 4 * n_embd
    c_fc: Projection,
    /// Projection layer: 4 * n_embd -> n_embd
    c_proj: Projection,
}

/// Activations cached by `forward_with_tape` for the backward pass
pub(crate) struct FeedForwardTape {
    /// Block input
    x: Tensor,
    /// Pre-activation output of the expansion layer
    pre_act: Tensor,
}

impl FeedForward {
    /// Create a new feed-forward layer
    ///
    /// # Arguments
    /// * `n_embd` - Embedding dimension
    /// * `seed` - Optional seed; the two layers draw from `seed` and `seed + 1`
    pub fn new(n_embd: usize, seed: Option<u64>) -> Self {
        Self {
            c_fc: Projection::new(n_embd, 4 * n_embd, seed),
            c_proj: Projection::new(4 * n_embd, n_embd, seed.map(|s| s + 1)),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    ///
    /// # Returns
    /// Output tensor [batch, seq_len, n_embd]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (out, _) = self.forward_with_tape(x)?;
        Ok(out)
    }

    /// Forward pass caching the activations needed by `backward`
    pub(crate) fn forward_with_tape(&self, x: &Tensor) -> Result<(Tensor, FeedForwardTape)> {
        let pre_act = self.c_fc.forward(x)?;

        // ReLU² activation
        let activated: Vec<f32> = pre_act
            .data()
            .iter()
            .map(|&v| {
                let r = v.max(0.0);
                r * r
            })
            .collect();
        let activated = Tensor::new(&activated, pre_act.shape());

        let out = self.c_proj.forward(&activated)?;
        Ok((
            out,
            FeedForwardTape {
                x: x.clone(),
                pre_act,
            },
        ))
    }

    /// Backward pass
    ///
    /// # Returns
    /// (gradient w.r.t. the block input, parameter gradients in the
    /// `parameters()` order [fc_weight, fc_bias, proj_weight, proj_bias])
    pub(crate) fn backward(
        &self,
        tape: &FeedForwardTape,
        d_output: &Tensor,
    ) -> (Tensor, Vec<Vec<f32>>) {
        // Recompute the activation from the cached pre-activation
        let activated: Vec<f32> = tape
            .pre_act
            .data()
            .iter()
            .map(|&v| {
                let r = v.max(0.0);
                r * r
            })
            .collect();
        let activated = Tensor::new(&activated, tape.pre_act.shape());

        let (d_activated, d_proj_w, d_proj_b) = self.c_proj.backward(&activated, d_output);

        // d/du relu(u)^2 = 2 * relu(u)
        let d_pre: Vec<f32> = d_activated
            .data()
            .iter()
            .zip(tape.pre_act.data().iter())
            .map(|(&g, &u)| g * 2.0 * u.max(0.0))
            .collect();
        let d_pre = Tensor::new(&d_pre, tape.pre_act.shape());

        let (d_input, d_fc_w, d_fc_b) = self.c_fc.backward(&tape.x, &d_pre);

        (d_input, vec![d_fc_w, d_fc_b, d_proj_w, d_proj_b])
    }
}

impl Module for FeedForward {
    /// Serialization shim: `save_model`/`load_model` walk the model through
    /// the `Module` impl; the training pipeline never calls this forward.
    fn forward(&self, input: &Tensor) -> Tensor {
        self.forward(input).expect("FeedForward forward pass failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters());
        params.extend(self.c_proj.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters_mut());
        params.extend(self.c_proj.parameters_mut());
        params
    }
}
