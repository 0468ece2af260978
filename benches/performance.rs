use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::{Rng, SeedableRng};
use rand::rngs::StdRng;
use std::hint::black_box;

use nitro::Nitro;

const DATASET_SIZE: u64 = 100_000;

fn setup_db() -> Nitro {
    let db = Nitro::new();
    let mut w = db.new_writer();
    for i in 0..DATASET_SIZE {
        w.put(&i.to_be_bytes());
    }
    db
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));
    group.bench_function("sequential", |b| {
        let db = Nitro::new();
        let mut w = db.new_writer();
        let mut i: u64 = 0;
        b.iter(|| {
            w.put(black_box(&i.to_be_bytes()));
            i += 1;
        });
    });
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let db = setup_db();
    let snap = db.new_snapshot().unwrap();

    let mut group = c.benchmark_group("seek");
    group.throughput(Throughput::Elements(1));
    group.bench_function("random", |b| {
        let mut rng = StdRng::seed_from_u64(42);
        let mut it = snap.new_iterator().unwrap();
        b.iter(|| {
            let k: u64 = rng.gen_range(0..DATASET_SIZE);
            it.seek(&k.to_be_bytes());
            black_box(it.valid());
        });
    });
    group.finish();

    snap.close();
    db.close();
}

fn bench_full_scan(c: &mut Criterion) {
    let db = setup_db();
    let snap = db.new_snapshot().unwrap();

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(DATASET_SIZE));
    group.bench_with_input(
        BenchmarkId::from_parameter(DATASET_SIZE),
        &DATASET_SIZE,
        |b, _| {
            b.iter(|| {
                let mut it = snap.new_iterator().unwrap();
                let mut n = 0u64;
                it.seek_first();
                while it.valid() {
                    black_box(it.get());
                    n += 1;
                    it.next();
                }
                it.close();
                n
            });
        },
    );
    group.finish();

    snap.close();
    db.close();
}

criterion_group!(benches, bench_put, bench_seek, bench_full_scan);
criterion_main!(benches);
