//! Dense projection layer with an explicit backward pass
//!
//! Weights are drawn from the same seeded normal distribution as the
//! embedding tables, so whole-model construction is reproducible from
//! `Seq2SeqConfig::seed`.

use anyhow::Result;
use aprender::autograd::Tensor;

use crate::init::init_projection_weight;

/// Affine projection y = x W^T + b over the last dimension
pub struct Projection {
    /// Weight tensor [out_features, in_features]
    weight: Tensor,
    /// Bias tensor [out_features]
    bias: Tensor,
    /// Input feature count
    in_features: usize,
    /// Output feature count
    out_features: usize,
}

impl Projection {
    /// Create a projection with seeded weight initialization and zero bias
    pub fn new(in_features: usize, out_features: usize, seed: Option<u64>) -> Self {
        Self {
            weight: init_projection_weight(in_features, out_features, seed),
            bias: Tensor::zeros(&[out_features]),
            in_features,
            out_features,
        }
    }

    /// Forward pass over the last dimension
    ///
    /// # Arguments
    /// * `x` - Input tensor [..., in_features]
    ///
    /// # Returns
    /// Output tensor [..., out_features]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shape = x.shape();
        if shape.is_empty() || shape[shape.len() - 1] != self.in_features {
            anyhow::bail!(
                "Projection expects last dimension {}, got shape {:?}",
                self.in_features,
                shape
            );
        }

        let rows = x.data().len() / self.in_features;
        let x_data = x.data();
        let w = self.weight.data();
        let b = self.bias.data();

        let mut output = vec![0.0; rows * self.out_features];
        for t in 0..rows {
            let x_row = &x_data[t * self.in_features..(t + 1) * self.in_features];
            for o in 0..self.out_features {
                let w_row = &w[o * self.in_features..(o + 1) * self.in_features];
                let mut sum = b[o];
                for i in 0..self.in_features {
                    sum += x_row[i] * w_row[i];
                }
                output[t * self.out_features + o] = sum;
            }
        }

        let mut out_shape = shape.to_vec();
        let last = out_shape.len() - 1;
        out_shape[last] = self.out_features;
        Ok(Tensor::new(&output, &out_shape))
    }

    /// Backward pass
    ///
    /// # Arguments
    /// * `input` - The forward input [..., in_features]
    /// * `d_output` - Gradient of the loss w.r.t. the forward output
    ///
    /// # Returns
    /// (gradient w.r.t. input, weight gradient, bias gradient)
    pub fn backward(&self, input: &Tensor, d_output: &Tensor) -> (Tensor, Vec<f32>, Vec<f32>) {
        let rows = input.data().len() / self.in_features;
        let x_data = input.data();
        let dy = d_output.data();
        let w = self.weight.data();

        let mut d_input = vec![0.0; x_data.len()];
        let mut d_weight = vec![0.0; w.len()];
        let mut d_bias = vec![0.0; self.out_features];

        for t in 0..rows {
            let x_row = &x_data[t * self.in_features..(t + 1) * self.in_features];
            let dy_row = &dy[t * self.out_features..(t + 1) * self.out_features];
            let dx_row = &mut d_input[t * self.in_features..(t + 1) * self.in_features];
            for o in 0..self.out_features {
                let g = dy_row[o];
                if g == 0.0 {
                    continue;
                }
                d_bias[o] += g;
                let w_row = &w[o * self.in_features..(o + 1) * self.in_features];
                let dw_row = &mut d_weight[o * self.in_features..(o + 1) * self.in_features];
                for i in 0..self.in_features {
                    dx_row[i] += g * w_row[i];
                    dw_row[i] += g * x_row[i];
                }
            }
        }

        (Tensor::new(&d_input, input.shape()), d_weight, d_bias)
    }

    /// Shared references to [weight, bias]
    pub fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    /// Mutable references to [weight, bias]
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }

    /// Access the weight tensor
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape_and_bias() {
        let proj = Projection::new(4, 3, Some(42));
        let x = Tensor::ones(&[2, 5, 4]);

        let y = proj.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 5, 3]);
    }

    #[test]
    fn test_seeded_construction_reproducible() {
        let a = Projection::new(8, 8, Some(7));
        let b = Projection::new(8, 8, Some(7));
        assert_eq!(a.weight().data(), b.weight().data());
    }

    #[test]
    fn test_rejects_wrong_last_dim() {
        let proj = Projection::new(4, 3, Some(1));
        let x = Tensor::ones(&[2, 5]);
        assert!(proj.forward(&x).is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let proj = Projection::new(3, 2, Some(11));
        let x = Tensor::new(&[0.5, -1.0, 2.0], &[1, 1, 3]);
        let d_out = Tensor::new(&[1.0, -0.5], &[1, 1, 2]);

        let (d_input, d_weight, _) = proj.backward(&x, &d_out);

        // d_input[i] = sum_o dy[o] * w[o][i]
        let w = proj.weight().data();
        for i in 0..3 {
            let expected = 1.0 * w[i] - 0.5 * w[3 + i];
            assert!((d_input.data()[i] - expected).abs() < 1e-6);
        }
        // d_weight[o][i] = dy[o] * x[i]
        assert!((d_weight[0] - 0.5).abs() < 1e-6);
        assert!((d_weight[3] - (-0.25)).abs() < 1e-6);
    }

    #[test]
    fn test_backward_bias_sums_rows() {
        let proj = Projection::new(2, 2, Some(3));
        let x = Tensor::ones(&[1, 3, 2]);
        let d_out = Tensor::ones(&[1, 3, 2]);

        let (_, _, d_bias) = proj.backward(&x, &d_out);
        assert_eq!(d_bias, vec![3.0, 3.0]);
    }
}
