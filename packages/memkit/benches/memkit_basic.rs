//! Basic benchmarks for the `memkit` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use memkit::{Arena, DebugAllocator, Pool, ViolationPolicy};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const SMALL: usize = 24;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("memkit_basic");

    group.bench_function("arena_alloc_small", |b| {
        b.iter_custom(|iters| {
            let mut arena = Arena::new();

            // Warm up the block chain so only bumping is measured.
            for _ in 0..iters {
                _ = arena.alloc(SMALL);
            }
            arena.reset();

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(arena.alloc(black_box(SMALL)));
            }

            start.elapsed()
        });
    });

    group.bench_function("arena_build_alloc_drop", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                let mut arena = Arena::new();
                _ = black_box(arena.alloc(black_box(SMALL)));
                drop(black_box(arena));
            }

            start.elapsed()
        });
    });

    group.bench_function("pool_alloc_recycle", |b| {
        b.iter_custom(|iters| {
            let mut pool = Pool::new(SMALL, 0);

            // Create the first page up front.
            let warm = pool.alloc().unwrap();
            // SAFETY: The item came from this pool and is recycled once.
            unsafe { pool.recycle(warm) };

            let start = Instant::now();

            for _ in 0..iters {
                let item = black_box(pool.alloc().unwrap());
                // SAFETY: The item came from this pool and is recycled once.
                unsafe { pool.recycle(item) };
            }

            start.elapsed()
        });
    });

    group.bench_function("pool_fill", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| Pool::new(SMALL, 0))
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                for _ in 0..pool.count_per_block() {
                    _ = black_box(pool.alloc());
                }
            }

            start.elapsed()
        });
    });

    group.bench_function("debug_malloc_free", |b| {
        b.iter_custom(|iters| {
            let debug = DebugAllocator::builder()
                .violation_policy(ViolationPolicy::ReturnError)
                .build();

            let start = Instant::now();

            for _ in 0..iters {
                let ptr = debug.malloc(black_box(SMALL)).unwrap().unwrap();
                debug.free(black_box(ptr)).unwrap();
            }

            start.elapsed()
        });
    });

    group.bench_function("debug_malloc_free_synchronized", |b| {
        b.iter_custom(|iters| {
            let debug = DebugAllocator::builder()
                .synchronized()
                .violation_policy(ViolationPolicy::ReturnError)
                .build();

            let start = Instant::now();

            for _ in 0..iters {
                let ptr = debug.malloc(black_box(SMALL)).unwrap().unwrap();
                debug.free(black_box(ptr)).unwrap();
            }

            start.elapsed()
        });
    });

    group.finish();
}
