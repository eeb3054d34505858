//! Benchmarks for stop-sequence scanning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use infer_bridge::backend::metal;
use infer_bridge::stop::{find_stop_sequence, trim_completion};

/// Roughly 4KB of completion text with no sentinel in it.
fn clean_text() -> String {
    "fn fibonacci(n: u64) -> u64 { match n { 0 => 0, 1 => 1, _ => fibonacci(n - 1) + fibonacci(n - 2) } }\n"
        .repeat(40)
}

fn bench_scan_clean_text(c: &mut Criterion) {
    let stops = metal::stop_strings();
    let text = clean_text();

    c.bench_function("stop_scan_clean_4kb", |b| {
        b.iter(|| black_box(find_stop_sequence(black_box(&text), &stops)))
    });
}

fn bench_scan_early_match(c: &mut Criterion) {
    let stops = metal::stop_strings();
    let mut text = clean_text();
    text.insert_str(64, "<|im_end|>");

    c.bench_function("stop_scan_early_match", |b| {
        b.iter(|| black_box(find_stop_sequence(black_box(&text), &stops)))
    });
}

fn bench_trim_completion(c: &mut Criterion) {
    let stops = metal::stop_strings();
    let mut text = clean_text();
    text.push_str("<|endoftext|>trailing junk");

    c.bench_function("trim_completion_4kb", |b| {
        b.iter(|| black_box(trim_completion(black_box(&text), &stops)))
    });
}

criterion_group!(
    benches,
    bench_scan_clean_text,
    bench_scan_early_match,
    bench_trim_completion,
);
criterion_main!(benches);
