//! Weight initialization helpers
//!
//! `aprender::nn::init` is not public, so the normal-distribution draw is
//! done here with the same Box-Muller transform aprender uses internally.

use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Initialize a projection weight with std = 1/sqrt(fan_in)
///
/// # Arguments
/// * `in_features` - Number of input features (fan_in)
/// * `out_features` - Number of output features (fan_out)
/// * `seed` - Optional random seed for reproducibility
///
/// # Returns
/// Weight tensor with shape [out_features, in_features]
pub(crate) fn init_projection_weight(
    in_features: usize,
    out_features: usize,
    seed: Option<u64>,
) -> Tensor {
    let std = 1.0 / (in_features as f32).sqrt();
    normal_tensor(&[out_features, in_features], std, seed)
}

/// Initialize an embedding table with a small fixed std
///
/// # Returns
/// Weight tensor with shape [num_embeddings, embedding_dim]
pub(crate) fn init_embedding_weight(
    num_embeddings: usize,
    embedding_dim: usize,
    seed: Option<u64>,
) -> Tensor {
    normal_tensor(&[num_embeddings, embedding_dim], 0.02, seed)
}

/// Draw a tensor from N(0, std^2) using the Box-Muller transform
fn normal_tensor(shape: &[usize], std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            std * z
        })
        .collect();

    Tensor::new(&data, shape)
}
