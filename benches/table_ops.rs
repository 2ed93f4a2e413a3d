//! Segment table hot path benchmarks.
//!
//! Run with: `cargo bench --bench table_ops`
//!
//! Measures the caller-facing operations (put/get/remove), remote apply
//! through the conflict resolver, and the frame codec.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use replimap::replication::frame::{Frame, FrameCodec};
use replimap::storage::{Entry, OriginId, SegmentLayout, SegmentTable, Version};
use replimap::{HybridClock, SystemClock};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

const KEYS: usize = 10_000;

fn table(segments: usize) -> SegmentTable {
    let clock = Arc::new(HybridClock::new(Arc::new(SystemClock::new())));
    SegmentTable::new(
        OriginId(1),
        clock,
        segments,
        SegmentLayout {
            max_entries: KEYS * 2 / segments,
            chunk_count: KEYS * 24 / segments,
            chunk_size: 64,
            retain_records: 1024,
            max_records: 4096,
        },
    )
}

fn keys() -> Vec<Bytes> {
    (0..KEYS).map(|i| Bytes::from(format!("key:{:08}", i))).collect()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    for value_len in [16, 128, 1024] {
        let keys = keys();
        let value = Bytes::from(vec![b'x'; value_len]);
        group.bench_with_input(BenchmarkId::new("overwrite", value_len), &value, |b, value| {
            let t = table(16);
            let mut i = 0;
            b.iter(|| {
                let key = keys[i % KEYS].clone();
                i += 1;
                t.put(black_box(key), value.clone()).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    let keys = keys();
    let t = table(16);
    for key in &keys {
        t.put(key.clone(), Bytes::from_static(b"value")).unwrap();
    }

    group.bench_function("hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            t.get(black_box(&keys[i % KEYS])).unwrap()
        })
    });
    group.bench_function("miss", |b| {
        b.iter(|| t.get(black_box(b"absent-key")).unwrap())
    });

    group.finish();
}

fn bench_segments(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_get_remove");
    group.throughput(Throughput::Elements(3));

    for segments in [1, 16, 64] {
        let keys = keys();
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, &n| {
            let t = table(n);
            let mut i = 0;
            b.iter(|| {
                let key = &keys[i % KEYS];
                i += 1;
                t.put(key.clone(), Bytes::from_static(b"v")).unwrap();
                black_box(t.get(key).unwrap());
                t.remove(key).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_remote");
    group.throughput(Throughput::Elements(1));

    let keys = keys();
    group.bench_function("newer", |b| {
        let t = table(16);
        let mut ts = 1u64 << 50;
        let mut i = 0;
        b.iter(|| {
            ts += 1;
            i += 1;
            let entry = Entry::live(
                keys[i % KEYS].clone(),
                Bytes::from_static(b"remote"),
                Version::new(ts, OriginId(2)),
            );
            t.apply_remote(black_box(entry)).unwrap()
        })
    });
    group.bench_function("stale", |b| {
        let t = table(16);
        t.put(keys[0].clone(), Bytes::from_static(b"local")).unwrap();
        b.iter(|| {
            let entry = Entry::live(
                keys[0].clone(),
                Bytes::from_static(b"old"),
                Version::new(1, OriginId(2)),
            );
            t.apply_remote(black_box(entry)).unwrap()
        })
    });

    group.finish();
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    group.throughput(Throughput::Elements(1));

    let frame = Frame::Delta {
        segment: 3,
        seq: 42,
        entry: Entry::live(
            Bytes::from_static(b"key:00000042"),
            Bytes::from(vec![b'x'; 128]),
            Version::new(1_700_000_000_000, OriginId(1)),
        ),
    };

    group.bench_function("encode_delta", |b| {
        let mut buf = BytesMut::with_capacity(256);
        b.iter(|| {
            buf.clear();
            FrameCodec.encode(black_box(frame.clone()), &mut buf).unwrap();
        })
    });

    let mut encoded = BytesMut::new();
    FrameCodec.encode(frame.clone(), &mut encoded).unwrap();
    group.bench_function("decode_delta", |b| {
        b.iter(|| {
            let mut buf = encoded.clone();
            FrameCodec.decode(black_box(&mut buf)).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_segments,
    bench_apply_remote,
    bench_frame_codec,
);
criterion_main!(benches);
