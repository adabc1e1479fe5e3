//! Performance benchmarks for the state system.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;
use tracestate::query::{query_history_range, query_history_range_sampled};
use tracestate::{
    CancelToken, FileBackend, FileBackendConfig, Quark, StateSystem, StateSystemBuilder,
    StateSystemReader, StateValue,
};

const ATTRIBUTES: usize = 16;

/// Round-robin writes over `ATTRIBUTES` attributes, closed at `writes`.
fn populate(ss: &StateSystem, writes: i64) -> Vec<Quark> {
    let quarks: Vec<_> = (0..ATTRIBUTES)
        .map(|i| {
            ss.get_or_create_absolute(&["Threads", i.to_string().as_str(), "Status"])
                .unwrap()
        })
        .collect();
    for t in 0..writes {
        let quark = quarks[t as usize % ATTRIBUTES];
        ss.modify(t, StateValue::Int((t % 5) as i32), quark).unwrap();
    }
    ss.close_history(writes).unwrap();
    quarks
}

fn create_file_system(dir: &TempDir) -> StateSystem {
    let backend = FileBackend::create(FileBackendConfig {
        path: dir.path().join("history"),
        ssid: "bench".to_string(),
        interval_cache_size: 1024,
        ..Default::default()
    })
    .unwrap();
    StateSystem::new(Arc::new(backend), true).unwrap()
}

/// Benchmark building a history of increasing length
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(20);

    for writes in [1_000i64, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::new("in_memory", writes), &writes, |b, &writes| {
            b.iter(|| {
                let ss = StateSystem::in_memory("bench", 0);
                black_box(populate(&ss, writes));
            });
        });

        group.bench_with_input(BenchmarkId::new("file", writes), &writes, |b, &writes| {
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                let ss = create_file_system(&dir);
                black_box(populate(&ss, writes));
            });
        });
    }

    group.finish();
}

/// Benchmark point queries against a built history
fn bench_single_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_state");

    let ss = StateSystem::in_memory("bench", 0);
    let quarks = populate(&ss, 100_000);
    group.bench_function("in_memory", |b| {
        let mut t = 0;
        b.iter(|| {
            t = (t + 7919) % 100_000;
            black_box(ss.query_single_state(t, quarks[3]).unwrap());
        });
    });

    let dir = TempDir::new().unwrap();
    let file_ss = create_file_system(&dir);
    let quarks = populate(&file_ss, 100_000);
    group.bench_function("file", |b| {
        let mut t = 0;
        b.iter(|| {
            t = (t + 7919) % 100_000;
            black_box(file_ss.query_single_state(t, quarks[3]).unwrap());
        });
    });

    group.bench_function("full_state", |b| {
        b.iter(|| black_box(ss.query_full_state(50_000).unwrap()));
    });

    group.finish();
}

/// Benchmark exact vs downsampled range queries
fn bench_range_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("range");

    let ss = StateSystem::in_memory("bench", 0);
    let quarks = populate(&ss, 100_000);
    let token = CancelToken::new();

    group.bench_function("exact", |b| {
        b.iter(|| black_box(query_history_range(&ss, quarks[0], 0, 100_000).unwrap()));
    });

    for resolution in [10i64, 100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("sampled", resolution),
            &resolution,
            |b, &resolution| {
                b.iter(|| {
                    black_box(
                        query_history_range_sampled(&ss, quarks[0], 0, 100_000, resolution, &token)
                            .unwrap(),
                    )
                });
            },
        );
    }

    group.finish();
}

/// Benchmark stack emulation
fn bench_stack(c: &mut Criterion) {
    c.bench_function("push_pop_depth_32", |b| {
        b.iter(|| {
            let ss = StateSystem::in_memory("bench", 0);
            let stack = ss.get_or_create_absolute(&["CallStack"]).unwrap();
            let mut t = 0;
            for depth in 0..32 {
                t += 1;
                ss.push(t, StateValue::Int(depth), stack).unwrap();
            }
            for _ in 0..32 {
                t += 1;
                black_box(ss.pop(t, stack).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_build,
    bench_single_state,
    bench_range_queries,
    bench_stack
);
criterion_main!(benches);
