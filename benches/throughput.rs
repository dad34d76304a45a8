//! Throughput Benchmark for kkv
//!
//! Measures the storage engine under various workloads, including values
//! that span several slab nodes and the cost of reclamation.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use kkv::protocol::{encode_request, frame_len, Command};
use kkv::storage::Engine;
use kkv::CommandHandler;
use std::sync::Arc;
use std::time::Duration;

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let engine = Arc::new(Engine::new());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            engine.set(key.as_bytes(), b"small_value").unwrap();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 1024];
        b.iter(|| {
            let key = format!("key:{}", i % 10_000);
            engine.set(key.as_bytes(), &value).unwrap();
            i += 1;
        });
    });

    // 64 KiB: a chain of 17 nodes
    group.bench_function("set_multi_node", |b| {
        let mut i = 0u64;
        let value = vec![b'x'; 64 * 1024];
        b.iter(|| {
            let key = format!("key:{}", i % 1_000);
            engine.set(key.as_bytes(), &value).unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let engine = Arc::new(Engine::new());

    for i in 0..100_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        engine.set(key.as_bytes(), value.as_bytes()).unwrap();
    }
    engine.set(b"large", &vec![b'y'; 64 * 1024]).unwrap();

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(engine.get(key.as_bytes(), &mut buf).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(engine.get(key.as_bytes(), &mut buf).is_err());
            i += 1;
        });
    });

    group.bench_function("get_multi_node", |b| {
        let mut buf = vec![0u8; 64 * 1024];
        b.iter(|| {
            black_box(engine.get(b"large", &mut buf).unwrap());
        });
    });

    group.finish();
}

/// Benchmark mixed workload (80% reads, 20% writes)
fn bench_mixed(c: &mut Criterion) {
    let engine = Arc::new(Engine::new());

    for i in 0..10_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        engine.set(key.as_bytes(), value.as_bytes()).unwrap();
    }

    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(1));

    group.bench_function("80_read_20_write", |b| {
        let mut i = 0u64;
        let mut buf = [0u8; 64];
        b.iter(|| {
            if i % 5 == 0 {
                let key = format!("new:{}", i % 50_000);
                engine.set(key.as_bytes(), b"value").unwrap();
            } else {
                let key = format!("key:{}", i % 10_000);
                black_box(engine.get(key.as_bytes(), &mut buf).unwrap());
            }
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark delete followed by batched reclamation
fn bench_reclaim(c: &mut Criterion) {
    let mut group = c.benchmark_group("reclaim");

    group.bench_function("delete_then_shrink_1000", |b| {
        b.iter_batched(
            || {
                let engine = Engine::new();
                for i in 0..1_000 {
                    let key = format!("key:{}", i);
                    engine.set(key.as_bytes(), b"value").unwrap();
                }
                engine
            },
            |engine| {
                for i in 0..1_000 {
                    let key = format!("key:{}", i);
                    engine.delete(key.as_bytes()).unwrap();
                }
                black_box(engine.shrink());
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

/// Benchmark request dispatch through the command handler, in place
fn bench_dispatch(c: &mut Criterion) {
    let handler = CommandHandler::new(Arc::new(Engine::new()));
    let set = encode_request(1, Command::Set, b"bench", &[b'v'; 100]);
    let get = encode_request(2, Command::Get, b"bench", b"");

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_get_pair", |b| {
        let mut buf = vec![0u8; 4096];
        b.iter(|| {
            buf[..set.len()].copy_from_slice(&set);
            let frame = frame_len(&buf[..set.len()], buf.len()).unwrap().unwrap();
            black_box(handler.process(&mut buf, frame));

            buf[..get.len()].copy_from_slice(&get);
            let frame = frame_len(&buf[..get.len()], buf.len()).unwrap().unwrap();
            black_box(handler.process(&mut buf, frame));
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let engine = Arc::new(Engine::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        let mut buf = [0u8; 16];
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            engine.set(key.as_bytes(), b"value").unwrap();
                            let _ = engine.get(key.as_bytes(), &mut buf);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(engine.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_mixed,
    bench_reclaim,
    bench_dispatch,
    bench_concurrent,
);

criterion_main!(benches);
