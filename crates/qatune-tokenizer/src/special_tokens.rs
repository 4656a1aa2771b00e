//! Special token handling

/// Special tokens used in question/answer tokenization
///
/// These tokens mark sequence boundaries and padding for batching. Training
/// reserves the lowest vocabulary ids for them in `all()` order: bos = 0,
/// pad = 1, eos = 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Beginning of Sequence token
    bos: String,
    /// End of Sequence token - terminates every encoded answer
    eos: String,
    /// Padding token - fills fixed-length sequences
    pad: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: "<|bos|>".to_string(),
            eos: "<|eos|>".to_string(),
            pad: "<|pad|>".to_string(),
        }
    }
}

impl SpecialTokens {
    /// Beginning of sequence token string
    pub fn bos(&self) -> &str {
        &self.bos
    }

    /// End of sequence token string
    pub fn eos(&self) -> &str {
        &self.eos
    }

    /// Padding token string
    pub fn pad(&self) -> &str {
        &self.pad
    }

    /// All special tokens in id-assignment order
    pub fn all(&self) -> Vec<&str> {
        vec![&self.bos, &self.pad, &self.eos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tokens() {
        let tokens = SpecialTokens::default();
        assert_eq!(tokens.bos(), "<|bos|>");
        assert_eq!(tokens.eos(), "<|eos|>");
        assert_eq!(tokens.pad(), "<|pad|>");
        assert_eq!(tokens.all().len(), 3);
    }
}
