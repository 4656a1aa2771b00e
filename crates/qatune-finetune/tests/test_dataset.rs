//! Dataset splitting property tests

use proptest::prelude::*;
use qatune_finetune::dataset::{split_train_eval, QaRecord};

fn records(n: usize) -> Vec<QaRecord> {
    (0..n)
        .map(|i| QaRecord {
            query: format!("question {i}"),
            answer: format!("answer {i}"),
        })
        .collect()
}

proptest! {
    #[test]
    fn split_is_always_a_partition(n in 2usize..200, seed in 0u64..1000) {
        let original = records(n);
        let (train, eval) = split_train_eval(original.clone(), 0.2, Some(seed)).unwrap();

        prop_assert_eq!(train.len() + eval.len(), n);

        let mut combined: Vec<&str> = train
            .iter()
            .chain(eval.iter())
            .map(|r| r.query.as_str())
            .collect();
        combined.sort_unstable();
        let mut expected: Vec<&str> = original.iter().map(|r| r.query.as_str()).collect();
        expected.sort_unstable();
        prop_assert_eq!(combined, expected);
    }

    #[test]
    fn eval_count_matches_rounded_fraction(n in 5usize..200, frac in 0.05f32..0.5) {
        let (_, eval) = split_train_eval(records(n), frac, Some(0)).unwrap();

        let expected = ((frac * n as f32).round() as usize).max(1);
        prop_assert_eq!(eval.len(), expected);
    }

    #[test]
    fn training_set_never_empty(n in 2usize..100, frac in 0.0f32..0.9) {
        if let Ok((train, _)) = split_train_eval(records(n), frac, Some(0)) {
            prop_assert!(!train.is_empty());
        }
    }
}
