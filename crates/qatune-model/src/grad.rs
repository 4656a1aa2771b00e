//! Gradient buffers keyed by dotted parameter name
//!
//! The backward pass writes one flat buffer per parameter, under the same
//! dotted names `named_parameters()` uses. The training loop accumulates
//! these across micro-batches and hands them to the optimizer.

use std::collections::BTreeMap;

/// Per-parameter gradients as flat f32 buffers
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    buffers: BTreeMap<String, Vec<f32>>,
}

impl Gradients {
    /// Create an empty gradient set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gradient buffer, summing elementwise if the name already exists
    ///
    /// Shared parameters (the token embedding table is looked up from both
    /// the encoder and decoder inputs) accumulate through repeated calls.
    pub fn accumulate(&mut self, name: &str, grad: Vec<f32>) {
        match self.buffers.get_mut(name) {
            Some(existing) => {
                debug_assert_eq!(existing.len(), grad.len(), "gradient size mismatch for {name}");
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => {
                self.buffers.insert(name.to_string(), grad);
            }
        }
    }

    /// Fold another gradient set into this one, summing shared names
    pub fn merge(&mut self, other: Gradients) {
        for (name, grad) in other.buffers {
            self.accumulate(&name, grad);
        }
    }

    /// Multiply every buffer by a scalar
    pub fn scale(&mut self, factor: f32) {
        for grad in self.buffers.values_mut() {
            for g in grad.iter_mut() {
                *g *= factor;
            }
        }
    }

    /// Gradient buffer for a parameter name, if one was produced
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.buffers.get(name).map(Vec::as_slice)
    }

    /// Iterate over (name, buffer) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.buffers.iter()
    }

    /// Number of parameter buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are held
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop all buffers
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_sums_existing() {
        let mut grads = Gradients::new();
        grads.accumulate("w", vec![1.0, 2.0]);
        grads.accumulate("w", vec![0.5, -1.0]);
        assert_eq!(grads.get("w"), Some(&[1.5, 1.0][..]));
    }

    #[test]
    fn test_merge_and_scale() {
        let mut a = Gradients::new();
        a.accumulate("w", vec![2.0]);
        let mut b = Gradients::new();
        b.accumulate("w", vec![4.0]);
        b.accumulate("b", vec![1.0]);

        a.merge(b);
        a.scale(0.5);
        assert_eq!(a.get("w"), Some(&[3.0][..]));
        assert_eq!(a.get("b"), Some(&[0.5][..]));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_missing_name_is_none() {
        let grads = Gradients::new();
        assert!(grads.get("nope").is_none());
        assert!(grads.is_empty());
    }
}
