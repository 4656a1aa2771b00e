//! Token-level cross-entropy loss

use anyhow::Result;
use aprender::autograd::Tensor;

/// Cross-entropy between logits and target token ids, ignoring padding
///
/// Positions whose target equals `ignore_id` contribute nothing; the result
/// is averaged over the remaining positions.
///
/// # Arguments
/// * `logits` - Model output [batch, seq_len, vocab_size]
/// * `targets` - Target token ids as f32 tensor [batch, seq_len]
/// * `ignore_id` - Token id excluded from the loss (padding)
///
/// # Returns
/// Scalar loss tensor of shape [1]
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor, ignore_id: u32) -> Result<Tensor> {
    let shape = logits.shape();
    if shape.len() != 3 {
        anyhow::bail!("Expected logits [batch, seq_len, vocab], got {:?}", shape);
    }
    let (batch, seq_len, vocab) = (shape[0], shape[1], shape[2]);

    let target_shape = targets.shape();
    if target_shape != [batch, seq_len] {
        anyhow::bail!(
            "Target shape {:?} does not match logits batch/seq {:?}",
            target_shape,
            &shape[..2]
        );
    }

    let logit_data = logits.data();
    let target_data = targets.data();

    let mut total = 0.0_f32;
    let mut count = 0usize;

    for t in 0..batch * seq_len {
        let target_id = target_data[t] as u32;
        if target_id == ignore_id {
            continue;
        }
        let target_idx = target_id as usize;
        if target_idx >= vocab {
            anyhow::bail!("Target id {} out of range for vocabulary {}", target_idx, vocab);
        }

        let row = &logit_data[t * vocab..(t + 1) * vocab];

        // log-softmax evaluated at the target index
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum: f32 = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln();
        total += log_sum + max_val - row[target_idx];
        count += 1;
    }

    if count == 0 {
        anyhow::bail!("No non-padding targets in batch");
    }

    Ok(Tensor::new(&[total / count as f32], &[1]))
}

/// Cross-entropy loss and its gradient w.r.t. the logits
///
/// Same averaging and padding semantics as [`cross_entropy_loss`]. For each
/// non-ignored position the logit gradient is (softmax - onehot) / count;
/// ignored positions get zero rows.
///
/// # Returns
/// (scalar loss value, gradient tensor shaped like `logits`)
pub fn cross_entropy_loss_with_grad(
    logits: &Tensor,
    targets: &Tensor,
    ignore_id: u32,
) -> Result<(f32, Tensor)> {
    let shape = logits.shape();
    if shape.len() != 3 {
        anyhow::bail!("Expected logits [batch, seq_len, vocab], got {:?}", shape);
    }
    let (batch, seq_len, vocab) = (shape[0], shape[1], shape[2]);

    let target_shape = targets.shape();
    if target_shape != [batch, seq_len] {
        anyhow::bail!(
            "Target shape {:?} does not match logits batch/seq {:?}",
            target_shape,
            &shape[..2]
        );
    }

    let logit_data = logits.data();
    let target_data = targets.data();

    let mut total = 0.0_f32;
    let mut count = 0usize;
    let mut d_logits = vec![0.0; logit_data.len()];

    for t in 0..batch * seq_len {
        let target_id = target_data[t] as u32;
        if target_id == ignore_id {
            continue;
        }
        let target_idx = target_id as usize;
        if target_idx >= vocab {
            anyhow::bail!("Target id {} out of range for vocabulary {}", target_idx, vocab);
        }

        let row = &logit_data[t * vocab..(t + 1) * vocab];
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_sum: f32 = row.iter().map(|&v| (v - max_val).exp()).sum();
        total += exp_sum.ln() + max_val - row[target_idx];
        count += 1;

        let d_row = &mut d_logits[t * vocab..(t + 1) * vocab];
        for (d, &v) in d_row.iter_mut().zip(row.iter()) {
            *d = (v - max_val).exp() / exp_sum;
        }
        d_row[target_idx] -= 1.0;
    }

    if count == 0 {
        anyhow::bail!("No non-padding targets in batch");
    }

    let inv_count = 1.0 / count as f32;
    for d in d_logits.iter_mut() {
        *d *= inv_count;
    }

    Ok((total * inv_count, Tensor::new(&d_logits, shape)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(&[1, 2, 4]);
        let targets = Tensor::new(&[0.0, 3.0], &[1, 2]);

        let loss = cross_entropy_loss(&logits, &targets, 99).unwrap();
        let expected = (4.0_f32).ln();
        assert!((loss.data()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_padding_positions_ignored() {
        // Position 1 is padding; its logits are wildly wrong but must not count
        let logits = Tensor::new(
            &[
                10.0, 0.0, 0.0, 0.0, // target 0, confident and correct
                -50.0, -50.0, -50.0, 50.0, // padding position
            ],
            &[1, 2, 4],
        );
        let targets = Tensor::new(&[0.0, 1.0], &[1, 2]);

        let loss = cross_entropy_loss(&logits, &targets, 1).unwrap();
        assert!(loss.data()[0] < 0.01);
    }

    #[test]
    fn test_all_padding_is_error() {
        let logits = Tensor::zeros(&[1, 2, 4]);
        let targets = Tensor::new(&[1.0, 1.0], &[1, 2]);
        assert!(cross_entropy_loss(&logits, &targets, 1).is_err());
    }

    #[test]
    fn test_target_out_of_range() {
        let logits = Tensor::zeros(&[1, 1, 4]);
        let targets = Tensor::new(&[7.0], &[1, 1]);
        assert!(cross_entropy_loss(&logits, &targets, 1).is_err());
    }

    #[test]
    fn test_grad_matches_loss_and_softmax() {
        let logits = Tensor::new(&[1.0, 0.0, -1.0, 2.0], &[1, 1, 4]);
        let targets = Tensor::new(&[3.0], &[1, 1]);

        let loss = cross_entropy_loss(&logits, &targets, 99).unwrap();
        let (loss_value, d_logits) =
            cross_entropy_loss_with_grad(&logits, &targets, 99).unwrap();
        assert!((loss.data()[0] - loss_value).abs() < 1e-6);

        // Gradient rows sum to zero (softmax minus onehot)
        let sum: f32 = d_logits.data().iter().sum();
        assert!(sum.abs() < 1e-6);
        // The target entry is the only negative one
        assert!(d_logits.data()[3] < 0.0);
        assert!(d_logits.data()[..3].iter().all(|&g| g > 0.0));
    }

    #[test]
    fn test_grad_zero_at_padding_positions() {
        let logits = Tensor::new(&[1.0, -2.0, 0.5, 3.0], &[1, 2, 2]);
        let targets = Tensor::new(&[0.0, 1.0], &[1, 2]);

        let (_, d_logits) = cross_entropy_loss_with_grad(&logits, &targets, 1).unwrap();
        assert!(d_logits.data()[2..].iter().all(|&g| g == 0.0));
        assert!(d_logits.data()[..2].iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_correct_class_lowers_loss() {
        let confident = Tensor::new(&[5.0, 0.0, 0.0, 0.0], &[1, 1, 4]);
        let wrong = Tensor::new(&[0.0, 0.0, 0.0, 5.0], &[1, 1, 4]);
        let targets = Tensor::new(&[0.0], &[1, 1]);

        let low = cross_entropy_loss(&confident, &targets, 99).unwrap();
        let high = cross_entropy_loss(&wrong, &targets, 99).unwrap();
        assert!(low.data()[0] < high.data()[0]);
    }
}
