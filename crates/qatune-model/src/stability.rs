//! Numerical stability checks
//!
//! The training loop validates every loss value before the optimizer step so
//! a NaN or Inf aborts the run instead of silently corrupting the weights.

use anyhow::Result;

/// Validate that a loss value is finite
///
/// # Errors
/// Returns an error if the value is NaN or infinite.
pub fn validate_loss(value: f32) -> Result<()> {
    if value.is_nan() {
        anyhow::bail!("Loss is NaN");
    }
    if value.is_infinite() {
        anyhow::bail!("Loss is infinite");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_loss_passes() {
        assert!(validate_loss(2.5).is_ok());
        assert!(validate_loss(0.0).is_ok());
    }

    #[test]
    fn test_nan_detected() {
        assert!(validate_loss(f32::NAN).is_err());
    }

    #[test]
    fn test_inf_detected() {
        assert!(validate_loss(f32::INFINITY).is_err());
        assert!(validate_loss(f32::NEG_INFINITY).is_err());
    }
}
