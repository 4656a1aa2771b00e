//! Question/answer dataset loading, splitting and tokenization

use std::path::Path;

use anyhow::{Context, Result};
use qatune_tokenizer::Tokenizer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

/// A single question/answer pair from the CSV
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QaRecord {
    /// Question text
    pub query: String,
    /// Answer text
    pub answer: String,
}

/// A tokenized training example with fixed-length sequences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    /// Question ids, padded/truncated to the source length
    pub input_ids: Vec<u32>,
    /// Padding mask over `input_ids`, 1 real / 0 padding
    pub attention_mask: Vec<u32>,
    /// Answer ids with terminating EOS, padded/truncated to the target length
    pub labels: Vec<u32>,
}

/// Load question/answer pairs from a CSV file with `query,answer` columns
///
/// Rows where either field is empty after trimming are skipped.
///
/// # Errors
/// Returns an error if the file cannot be opened, a row fails to parse, or
/// no usable rows remain.
pub fn load_qa_csv<P: AsRef<Path>>(path: P) -> Result<Vec<QaRecord>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open dataset: {}", path.display()))?;

    let mut records = Vec::new();
    for (row_num, result) in reader.deserialize().enumerate() {
        let record: QaRecord = result
            .with_context(|| format!("Failed to parse row {} in {}", row_num + 1, path.display()))?;

        if record.query.trim().is_empty() || record.answer.trim().is_empty() {
            continue;
        }

        records.push(record);
    }

    if records.is_empty() {
        anyhow::bail!("No usable question/answer pairs in {}", path.display());
    }

    Ok(records)
}

/// Shuffle and split records into train and eval sets
///
/// The eval set receives `round(eval_fraction * N)` records, at least one of
/// each side when the fraction is strictly between 0 and 1.
///
/// # Errors
/// Returns an error if the fraction is outside [0, 1) or the split would
/// leave the training set empty.
pub fn split_train_eval(
    mut records: Vec<QaRecord>,
    eval_fraction: f32,
    seed: Option<u64>,
) -> Result<(Vec<QaRecord>, Vec<QaRecord>)> {
    if !(0.0..1.0).contains(&eval_fraction) {
        anyhow::bail!("Eval fraction must be in [0, 1), got {}", eval_fraction);
    }

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    records.shuffle(&mut rng);

    let n = records.len();
    let mut eval_count = (eval_fraction * n as f32).round() as usize;
    if eval_fraction > 0.0 && eval_count == 0 && n > 1 {
        eval_count = 1;
    }
    if eval_count >= n {
        anyhow::bail!(
            "Eval split of {} records would leave no training data (dataset has {})",
            eval_count,
            n
        );
    }

    let eval = records.split_off(n - eval_count);
    Ok((records, eval))
}

/// Tokenize records into fixed-length training examples
///
/// Pure with respect to the tokenizer: the same records and limits always
/// produce the same examples.
pub fn tokenize_records(
    tokenizer: &Tokenizer,
    records: &[QaRecord],
    max_source_len: usize,
    max_target_len: usize,
    pad_id: u32,
    eos_id: u32,
) -> Result<Vec<TokenizedExample>> {
    records
        .iter()
        .map(|record| {
            let (input_ids, attention_mask) =
                tokenizer.encode_source(&record.query, max_source_len, pad_id)?;
            let labels =
                tokenizer.encode_target(&record.answer, max_target_len, pad_id, eos_id)?;
            Ok(TokenizedExample {
                input_ids,
                attention_mask,
                labels,
            })
        })
        .collect()
}
