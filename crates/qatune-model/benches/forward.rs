//! Benchmark for training forward pass performance

use aprender::autograd::Tensor;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qatune_model::{Seq2Seq, Seq2SeqConfig};

fn bench_training_forward(c: &mut Criterion) {
    let model = Seq2Seq::new(Seq2SeqConfig::tiny());

    let mut group = c.benchmark_group("training_forward");

    // Benchmark different source lengths with a fixed short target
    for src_len in [4, 8, 16, 32].iter() {
        let input_ids = Tensor::new(&vec![3.0; *src_len], &[1, *src_len]);
        let labels = Tensor::new(&[5.0, 6.0, 7.0, 8.0], &[1, 4]);

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("src_len_{}", src_len)),
            &input_ids,
            |b, input_ids| {
                b.iter(|| {
                    let _ = black_box(
                        model
                            .forward_training(black_box(input_ids), None, black_box(&labels))
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let model = Seq2Seq::new(Seq2SeqConfig::tiny());

    let mut group = c.benchmark_group("encode");
    let input_ids = Tensor::new(&vec![3.0; 16], &[1, 16]);
    let mask = Tensor::ones(&[1, 16]);

    group.bench_function("masked_src_16", |b| {
        b.iter(|| {
            let _ = black_box(
                model
                    .encode(black_box(&input_ids), Some(black_box(&mask)))
                    .unwrap(),
            );
        });
    });

    group.finish();
}

criterion_group!(benches, bench_training_forward, bench_encode);
criterion_main!(benches);
