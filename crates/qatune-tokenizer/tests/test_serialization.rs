//! Tokenizer save/load tests

use qatune_tokenizer::Tokenizer;
use tempfile::TempDir;

fn trained_tokenizer() -> Tokenizer {
    let corpus = [
        "what is the capital of france?",
        "paris is the capital of france",
        "how do transformers work?",
    ];
    Tokenizer::train_from_iterator(corpus.iter(), 400).expect("Failed to train tokenizer")
}

#[test]
fn test_save_creates_tokenizer_json() {
    let tokenizer = trained_tokenizer();
    let temp_dir = TempDir::new().expect("tempdir");

    tokenizer.save(temp_dir.path()).expect("save failed");
    assert!(temp_dir.path().join("tokenizer.json").exists());
}

#[test]
fn test_reloaded_tokenizer_encodes_identically() {
    let tokenizer = trained_tokenizer();
    let temp_dir = TempDir::new().expect("tempdir");
    tokenizer.save(temp_dir.path()).expect("save failed");

    let reloaded = Tokenizer::from_directory(temp_dir.path()).expect("load failed");
    assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());

    let text = "what is the capital of france?";
    assert_eq!(
        reloaded.encode(text).expect("encode"),
        tokenizer.encode(text).expect("encode")
    );
}

#[test]
fn test_reloaded_fixed_length_encoding_matches() {
    let tokenizer = trained_tokenizer();
    let temp_dir = TempDir::new().expect("tempdir");
    tokenizer.save(temp_dir.path()).expect("save failed");

    let reloaded = Tokenizer::from_directory(temp_dir.path()).expect("load failed");

    let (ids_a, mask_a) = tokenizer
        .encode_source("how do transformers work?", 64, 1)
        .expect("encode");
    let (ids_b, mask_b) = reloaded
        .encode_source("how do transformers work?", 64, 1)
        .expect("encode");
    assert_eq!(ids_a, ids_b);
    assert_eq!(mask_a, mask_b);
}

#[test]
fn test_reloaded_special_token_ids_preserved() {
    let tokenizer = trained_tokenizer();
    let temp_dir = TempDir::new().expect("tempdir");
    tokenizer.save(temp_dir.path()).expect("save failed");

    let reloaded = Tokenizer::from_directory(temp_dir.path()).expect("load failed");
    assert_eq!(reloaded.bos_id().expect("bos"), 0);
    assert_eq!(reloaded.pad_id().expect("pad"), 1);
    assert_eq!(reloaded.eos_id().expect("eos"), 2);
}

#[test]
fn test_missing_directory_fails() {
    let temp_dir = TempDir::new().expect("tempdir");
    let missing = temp_dir.path().join("nope");
    assert!(Tokenizer::from_directory(&missing).is_err());
}
