// Criterion benchmarks for the caderpc-common wire codec
//
// Run benchmarks with:
//   cargo bench -p caderpc-common
//
// For detailed output with plots:
//   cargo bench -p caderpc-common -- --save-baseline main

use bytes::BytesMut;
use caderpc_common::codec::WireCodec;
use caderpc_common::limit::{ConcurrencyLimiter, Limiter, RateLimiter};
use caderpc_common::{Message, Request, Response};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn small_request() -> Message {
    Message::Request(Request::new(
        "Calculator",
        "add",
        vec!["int".into(), "int".into()],
        vec![json!(1), json!(2)],
    ))
}

fn large_response() -> Message {
    let rows: Vec<_> = (0..200)
        .map(|i| json!({"id": i, "name": format!("row-{}", i), "score": i as f64 * 1.5}))
        .collect();
    Message::Response(Response::success(42, json!(rows)))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for (serializer, compressor) in [("json", "none"), ("json", "zstd"), ("msgpack", "gzip")] {
        let codec = WireCodec::with_defaults(serializer, compressor).unwrap();
        let small = small_request();
        let large = large_response();

        group.bench_function(format!("small_{}_{}", serializer, compressor), |b| {
            let mut buf = BytesMut::with_capacity(1024);
            b.iter(|| {
                buf.clear();
                codec.encode(black_box(&small), &mut buf).unwrap();
            });
        });

        group.bench_function(format!("large_{}_{}", serializer, compressor), |b| {
            let mut buf = BytesMut::with_capacity(64 * 1024);
            b.iter(|| {
                buf.clear();
                codec.encode(black_box(&large), &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for (serializer, compressor) in [("json", "none"), ("json", "zstd"), ("msgpack", "gzip")] {
        let codec = WireCodec::with_defaults(serializer, compressor).unwrap();
        let frame = codec.encode_to_bytes(&large_response()).unwrap();

        group.bench_function(format!("large_{}_{}", serializer, compressor), |b| {
            b.iter(|| {
                let mut buf = BytesMut::from(&frame[..]);
                black_box(codec.decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_limiters(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiters");

    group.bench_function("concurrency_acquire_release", |b| {
        let limiter = ConcurrencyLimiter::new(1024);
        b.iter(|| {
            if limiter.try_acquire() {
                limiter.release(1);
            }
        });
    });

    group.bench_function("rate_acquire", |b| {
        let limiter = RateLimiter::new(u32::MAX as u64);
        b.iter(|| black_box(limiter.try_acquire()));
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_limiters);
criterion_main!(benches);
