use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use warp_pool::backend::{MemoryBackend, MemoryRaster};
use warp_pool::{Attempts, DatasetSelector, PixelType, PoolConfig, ReadRequest, WarpContext, Window};

fn context(capacity: usize, uris: &[&str]) -> WarpContext {
    let backend = MemoryBackend::new();
    for uri in uris {
        backend.insert(*uri, MemoryRaster::gradient(512, 512, 1));
    }
    WarpContext::new(PoolConfig::with_capacity(capacity), Arc::new(backend)).unwrap()
}

/// Cost of a dispatch against an already open entry
fn benchmark_dispatch_hot(c: &mut Criterion) {
    let ctx = context(4, &["mem://hot"]);
    let token = ctx.get_token("mem://hot", Vec::<String>::new()).unwrap();
    ctx.band_count(token, DatasetSelector::Source, Attempts::bounded(2))
        .unwrap();

    c.bench_function("dispatch_band_count", |b| {
        b.iter(|| {
            ctx.band_count(black_box(token), DatasetSelector::Source, Attempts::bounded(2))
                .unwrap()
        })
    });
}

/// Window reads through the pool
fn benchmark_read_window(c: &mut Criterion) {
    let ctx = context(4, &["mem://read"]);
    let token = ctx.get_token("mem://read", Vec::<String>::new()).unwrap();
    let request = ReadRequest::new(1, Window::new(64, 64, 256, 256), PixelType::Float32);
    let mut out = vec![0u8; request.byte_len().unwrap()];

    c.bench_function("read_window_256", |b| {
        b.iter(|| {
            ctx.read_window_into(token, DatasetSelector::Source, black_box(&request), Attempts::bounded(2), &mut out)
                .unwrap()
        })
    });
}

/// Every call evicts: two datasets alternating through a single slot
fn benchmark_eviction_churn(c: &mut Criterion) {
    let ctx = context(1, &["mem://x", "mem://y"]);
    let x = ctx.get_token("mem://x", Vec::<String>::new()).unwrap();
    let y = ctx.get_token("mem://y", Vec::<String>::new()).unwrap();

    c.bench_function("eviction_churn", |b| {
        b.iter(|| {
            ctx.band_count(x, DatasetSelector::Source, Attempts::bounded(4)).unwrap();
            ctx.band_count(y, DatasetSelector::Source, Attempts::bounded(4)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    benchmark_dispatch_hot,
    benchmark_read_window,
    benchmark_eviction_churn
);
criterion_main!(benches);
