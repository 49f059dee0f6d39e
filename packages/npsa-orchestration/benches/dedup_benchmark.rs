//! Benchmark for final-artifact deduplication
//!
//! Measures:
//! - Dedup time by record count
//! - Effect of the duplicate ratio across units

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use npsa_orchestration::{dedup_records, Record};

/// Records for `units` counties; every `dup_every`-th record repeats an earlier
/// contact with different case and whitespace.
fn generate_records(units: usize, per_unit: usize, dup_every: usize) -> Vec<Record> {
    let mut records = Vec::with_capacity(units * per_unit);
    for unit in 0..units {
        for i in 0..per_unit {
            let n = unit * per_unit + i;
            let id = if dup_every > 0 && n % dup_every == 0 && n > 0 {
                n / 2
            } else {
                n
            };
            let email = if id % 3 == 0 {
                None
            } else if n == id {
                Some(format!("staff{}@district{}.k12.us", id, unit))
            } else {
                Some(format!("  Staff{}@District{}.K12.us", id, unit))
            };
            records.push(Record {
                first_name: format!("First{}", id),
                last_name: format!("Last{}", id),
                title: "Principal".to_string(),
                contact_channel: email,
                phone: String::new(),
                org_name: format!("District {}", unit),
                source_locator: format!("https://www.district{}.k12.us/staff", unit),
            });
        }
    }
    records
}

fn bench_dedup_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_by_size");

    for units in [10, 88, 254].iter() {
        let records = generate_records(*units, 40, 7);
        group.bench_with_input(BenchmarkId::from_parameter(units), &records, |b, records| {
            b.iter(|| dedup_records(black_box(records.clone())))
        });
    }

    group.finish();
}

fn bench_dedup_by_duplicate_ratio(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_by_duplicate_ratio");

    for dup_every in [0, 10, 2].iter() {
        let records = generate_records(88, 40, *dup_every);
        group.bench_with_input(
            BenchmarkId::from_parameter(dup_every),
            &records,
            |b, records| b.iter(|| dedup_records(black_box(records.clone()))),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dedup_by_size, bench_dedup_by_duplicate_ratio);
criterion_main!(benches);
