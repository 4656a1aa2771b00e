//! RMSNorm normalization
//!
//! Implemented at the data level so the backward pass can mirror the
//! forward computation exactly.

use anyhow::Result;
use aprender::autograd::Tensor;

/// Epsilon added under the square root for numerical stability
const RMS_NORM_EPS: f32 = 1e-6;

/// Apply RMSNorm over the last dimension (no learnable parameters)
///
/// RMSNorm: x / sqrt(mean(x^2) + eps). Unlike LayerNorm the mean is not
/// subtracted, which is all the pre-norm blocks here need.
///
/// # Arguments
/// * `x` - Input tensor of shape [..., hidden_dim]
///
/// # Returns
/// Normalized tensor with the same shape as the input
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let shape = x.shape();
    if shape.is_empty() {
        anyhow::bail!("Input tensor must have at least one dimension");
    }

    let hidden_dim = shape[shape.len() - 1];
    let rows = x.data().len() / hidden_dim;
    let data = x.data();

    let mut output = vec![0.0; data.len()];
    for t in 0..rows {
        let row = &data[t * hidden_dim..(t + 1) * hidden_dim];
        let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / hidden_dim as f32;
        let inv_rms = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
        for (o, &v) in output[t * hidden_dim..(t + 1) * hidden_dim]
            .iter_mut()
            .zip(row.iter())
        {
            *o = v * inv_rms;
        }
    }

    Ok(Tensor::new(&output, shape))
}

/// Backward pass for `rms_norm`
///
/// With r = sqrt(mean(x^2) + eps) and y_j = x_j / r:
/// dx_j = dy_j / r - x_j * (sum_i dy_i x_i) / (n * r^3)
///
/// # Arguments
/// * `x` - The forward input
/// * `d_output` - Gradient of the loss w.r.t. the forward output
pub fn rms_norm_backward(x: &Tensor, d_output: &Tensor) -> Tensor {
    let shape = x.shape();
    let hidden_dim = shape[shape.len() - 1];
    let rows = x.data().len() / hidden_dim;
    let data = x.data();
    let dy = d_output.data();

    let mut d_input = vec![0.0; data.len()];
    for t in 0..rows {
        let offset = t * hidden_dim;
        let row = &data[offset..offset + hidden_dim];
        let dy_row = &dy[offset..offset + hidden_dim];

        let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / hidden_dim as f32;
        let r_sq = mean_sq + RMS_NORM_EPS;
        let inv_r = 1.0 / r_sq.sqrt();
        let dot: f32 = dy_row.iter().zip(row.iter()).map(|(&g, &v)| g * v).sum();
        let scale = dot / (hidden_dim as f32 * r_sq) * inv_r;

        for i in 0..hidden_dim {
            d_input[offset + i] = dy_row[i] * inv_r - row[i] * scale;
        }
    }

    Tensor::new(&d_input, shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_shape() {
        let x = Tensor::ones(&[2, 4]);
        let result = rms_norm(&x).expect("RMSNorm failed");
        assert_eq!(result.shape(), x.shape());
    }

    #[test]
    fn test_rms_norm_unit_rms() {
        let x = Tensor::new(&[3.0, -4.0], &[1, 2]);
        let y = rms_norm(&x).expect("RMSNorm failed");
        let rms: f32 =
            (y.data().iter().map(|&v| v * v).sum::<f32>() / 2.0).sqrt();
        assert!((rms - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_rms_norm_zero_input() {
        let x = Tensor::zeros(&[2, 4]);
        let y = rms_norm(&x).expect("RMSNorm failed");
        assert!(y.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let x_vals = [0.7, -1.2, 0.3, 2.1];
        let x = Tensor::new(&x_vals, &[1, 4]);
        let d_out = Tensor::new(&[1.0, -0.5, 0.25, 0.8], &[1, 4]);

        let analytic = rms_norm_backward(&x, &d_out);

        let eps = 1e-3;
        for i in 0..4 {
            let mut plus = x_vals;
            plus[i] += eps;
            let mut minus = x_vals;
            minus[i] -= eps;

            let y_plus = rms_norm(&Tensor::new(&plus, &[1, 4])).unwrap();
            let y_minus = rms_norm(&Tensor::new(&minus, &[1, 4])).unwrap();

            // Directional derivative of <d_out, y> w.r.t. x[i]
            let f_plus: f32 = y_plus
                .data()
                .iter()
                .zip(d_out.data().iter())
                .map(|(&y, &g)| y * g)
                .sum();
            let f_minus: f32 = y_minus
                .data()
                .iter()
                .zip(d_out.data().iter())
                .map(|(&y, &g)| y * g)
                .sum();
            let numeric = (f_plus - f_minus) / (2.0 * eps);

            assert!(
                (analytic.data()[i] - numeric).abs() < 1e-2,
                "grad mismatch at {i}: {} vs {numeric}",
                analytic.data()[i]
            );
        }
    }
}
