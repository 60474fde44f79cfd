use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use callisto::lru::RecencyCache;
use callisto::protocol::{encode_command, Frame};
use callisto::ring::HashRing;

fn protocol_benchmarks(c: &mut Criterion) {
    c.bench_function("parse cache get frame", |b| {
        let mut buffer = BytesMut::new();
        encode_command(&[b"CACHE.GET", b"assets", b"logo.png"], &mut buffer);

        b.iter(|| {
            let frame = Frame::parse(black_box(&buffer)).unwrap().unwrap();
            black_box(frame.len());
        })
    });

    c.bench_function("parse partial frame", |b| {
        let buffer = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$6\r\nass");

        b.iter(|| {
            let result = Frame::parse(black_box(&buffer)).unwrap();
            black_box(result.is_none());
        })
    });

    c.bench_function("encode cache get command", |b| {
        b.iter(|| {
            let mut buffer = BytesMut::new();
            encode_command(&[b"CACHE.GET", b"assets", b"logo.png"], &mut buffer);
            black_box(buffer);
        })
    });
}

fn ring_benchmarks(c: &mut Criterion) {
    c.bench_function("ring lookup with 16 members", |b| {
        let mut ring = HashRing::new(50, None);
        for i in 0..16 {
            ring.add(&format!("cache-{}", i));
        }

        b.iter(|| {
            black_box(ring.get(black_box("some/resource/logo.png")));
        })
    });
}

fn recency_benchmarks(c: &mut Criterion) {
    c.bench_function("recency cache add and get", |b| {
        let mut cache: RecencyCache<String, usize> = RecencyCache::new(1024, None);
        let mut counter = 0usize;

        b.iter(|| {
            counter += 1;
            cache.add(format!("key-{}", counter % 2048), counter);
            black_box(cache.get(&format!("key-{}", (counter / 2) % 2048)));
        })
    });
}

criterion_group!(
    benches,
    protocol_benchmarks,
    ring_benchmarks,
    recency_benchmarks
);
criterion_main!(benches);
