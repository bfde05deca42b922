//! B-tree and merged-view benchmarks.
//!
//! The numbers to watch: point reads through the cache, insert
//! throughput across leaf splits, and the overhead the transaction
//! overlay adds to a plain btree lookup.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

use burrowdb::{DbConfig, EnvParams, Environment, FindMode, KeyLayout};

fn env_with_keys(count: u32) -> (tempfile::TempDir, Environment, burrowdb::DbId) {
    let dir = tempdir().unwrap();
    let env = Environment::create(
        &dir.path().join("bench.db"),
        0,
        0o644,
        EnvParams::default(),
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbConfig {
                key_layout: KeyLayout::Binary(16),
                ..DbConfig::default()
            },
        )
        .unwrap();
    for i in 0..count {
        let key = format!("key-{i:08}");
        let val = format!("value-{i:08}");
        env.insert(db, None, key.as_bytes(), val.as_bytes(), 0)
            .unwrap();
    }
    (dir, env, db)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for count in [100u32, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let env = Environment::create(
                        &dir.path().join("bench.db"),
                        0,
                        0o644,
                        EnvParams::default(),
                    )
                    .unwrap();
                    let db = env.create_db(1, DbConfig::default()).unwrap();
                    (dir, env, db)
                },
                |(dir, env, db)| {
                    for i in 0..count {
                        let key = format!("key-{i:08}");
                        env.insert(db, None, key.as_bytes(), b"value", 0).unwrap();
                    }
                    (dir, env)
                },
            );
        });
    }
    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");
    let (_dir, env, db) = env_with_keys(10_000);

    group.bench_function("point_read_cached", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key-{:08}", i % 10_000);
            i = i.wrapping_add(7919);
            black_box(env.find(db, None, key.as_bytes(), FindMode::Exact).unwrap())
        });
    });

    group.bench_function("approx_neighbor", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key-{:08}", i % 10_000);
            i = i.wrapping_add(4993);
            black_box(env.find(db, None, key.as_bytes(), FindMode::Geq).unwrap())
        });
    });
    group.finish();
}

fn bench_txn_overlay(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn_overlay");
    let (_dir, env, db) = env_with_keys(10_000);

    // a live overlay of 1000 pending ops on top of the tree
    let txn = env.begin(0).unwrap();
    for i in 0..1000u32 {
        let key = format!("pend-{i:08}");
        env.insert(db, Some(txn), key.as_bytes(), b"pending", 0)
            .unwrap();
    }

    group.bench_function("merged_point_read", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key-{:08}", i % 10_000);
            i = i.wrapping_add(7919);
            black_box(
                env.find(db, Some(txn), key.as_bytes(), FindMode::Exact)
                    .unwrap(),
            )
        });
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_find, bench_txn_overlay);
criterion_main!(benches);
