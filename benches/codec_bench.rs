// Benchmarks for the management-datagram codec.
use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fabriclink::protocol::{MadCodec, MadFrame};
use tokio_util::codec::{Decoder, Encoder};

const PAYLOAD_SIZES: &[usize] = &[0, 64, 1024, 16 * 1024, 256 * 1024];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for &size in PAYLOAD_SIZES {
        let frame = MadFrame::request(1, 0x0011, Bytes::from(vec![0xABu8; size]));
        group.throughput(Throughput::Bytes(frame.encoded_len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut codec = MadCodec;
            let mut buf = BytesMut::with_capacity(frame.encoded_len());
            b.iter(|| {
                buf.clear();
                codec.encode(frame.clone(), &mut buf).unwrap();
                std::hint::black_box(buf.len())
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for &size in PAYLOAD_SIZES {
        let frame = MadFrame::request(1, 0x0011, Bytes::from(vec![0xABu8; size]));
        let encoded = frame.encode_to_vec().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            let mut codec = MadCodec;
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                std::hint::black_box(decoded.payload.len())
            });
        });
    }
    group.finish();
}

fn bench_streaming_decode(c: &mut Criterion) {
    // The path the read loop actually takes: many frames arriving in one
    // buffer, decoded back to back.
    let frames: Vec<MadFrame> = (0..64)
        .map(|i| MadFrame::request(i, 0x0011, Bytes::from(vec![i as u8; 512])))
        .collect();
    let mut encoded = BytesMut::new();
    let mut codec = MadCodec;
    for frame in &frames {
        codec.encode(frame.clone(), &mut encoded).unwrap();
    }
    let encoded = encoded.freeze();

    let mut group = c.benchmark_group("streaming_decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("64_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            let mut count = 0usize;
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                count += frame.payload.len();
            }
            std::hint::black_box(count)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_streaming_decode);
criterion_main!(benches);
