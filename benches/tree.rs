//! Point-operation benchmarks for the tree core.
//!
//! These track the costs the design optimizes for: latch-free point reads
//! against a warm tree, single-latch inserts, and descent through layered
//! keys.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slicetree::{PagePool, SliceTree, TxnContext};

fn warm_tree(records: u64) -> SliceTree {
    let tree = SliceTree::create(Arc::new(PagePool::new(8192))).unwrap();
    let mut ctx = TxnContext::new(1);
    for i in 0..records {
        tree.insert_record_normalized(&mut ctx, i * 7, &i.to_le_bytes())
            .unwrap();
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");
    for count in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, &count| {
            b.iter_with_setup(
                || SliceTree::create(Arc::new(PagePool::new(8192))).unwrap(),
                |tree| {
                    let mut ctx = TxnContext::new(1);
                    for i in 0..count {
                        tree.insert_record_normalized(&mut ctx, i, &i.to_le_bytes())
                            .unwrap();
                    }
                    tree
                },
            );
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_get");
    let tree = warm_tree(100_000);
    let mut ctx = TxnContext::new(2);
    let mut buf = [0u8; 8];

    group.throughput(Throughput::Elements(1));
    group.bench_function("normalized_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 7) % 100_000;
            let len = tree
                .get_record_normalized(&mut ctx, black_box(i * 7), &mut buf)
                .unwrap();
            black_box(&buf[..len]);
        });
    });
    group.bench_function("normalized_miss", |b| {
        b.iter(|| {
            let miss = tree.get_record_normalized(&mut ctx, black_box(u64::MAX - 3), &mut buf);
            black_box(miss.is_err());
        });
    });
    group.finish();
}

fn bench_layered(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_layered");
    let tree = SliceTree::create(Arc::new(PagePool::new(8192))).unwrap();
    let mut ctx = TxnContext::new(1);
    // three shared slices push these keys to layer 3
    let mut keys = Vec::new();
    for i in 0u64..1_000 {
        let mut key = b"prefix00prefix01prefix02".to_vec();
        key.extend_from_slice(&i.to_be_bytes());
        tree.insert_record(&mut ctx, &key, &i.to_le_bytes()).unwrap();
        keys.push(key);
    }

    let mut buf = [0u8; 8];
    group.throughput(Throughput::Elements(1));
    group.bench_function("get_layer3", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 13) % keys.len();
            let len = tree.get_record(&mut ctx, black_box(&keys[i]), &mut buf).unwrap();
            black_box(&buf[..len]);
        });
    });
    group.finish();
}

fn bench_increment(c: &mut Criterion) {
    let tree = SliceTree::create(Arc::new(PagePool::new(64))).unwrap();
    let mut ctx = TxnContext::new(1);
    tree.insert_record(&mut ctx, b"counter", &[0u8; 8]).unwrap();

    c.bench_function("tree_increment_u64", |b| {
        b.iter(|| {
            black_box(
                tree.increment_record::<u64>(&mut ctx, b"counter", 1, 0)
                    .unwrap(),
            );
        });
    });
}

criterion_group!(benches, bench_insert, bench_get, bench_layered, bench_increment);
criterion_main!(benches);
