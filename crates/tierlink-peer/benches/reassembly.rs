//! Chunked transfer benchmarks
//!
//! - Splitting a payload into wire messages
//! - Reassembling chunks delivered in order and in reverse
//! - Encoding and decoding chunk frames
//!
//! Run with: cargo bench --bench reassembly -p tierlink-peer

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tierlink_core::{FrameDecoder, MessageBody, CHUNK_SIZE};
use tierlink_peer::{split_payload, transfer_messages, ChunkOutcome, ChunkReassembler};

const SIZES: [(&str, usize); 3] = [
    ("50KB", 50_000),
    ("1MB", 1024 * 1024),
    ("8MB", 8 * 1024 * 1024),
];

fn payload(size: usize) -> Bytes {
    Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>())
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");

    for (name, size) in SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("messages", name), &data, |b, data| {
            b.iter(|| transfer_messages("bench-peer", "bench", black_box(data), CHUNK_SIZE))
        });
    }

    group.finish();
}

fn reassemble(chunks: &[(u32, Bytes)], total: u32) -> Option<Bytes> {
    let mut reassembler = ChunkReassembler::default();
    let mut done = None;
    for (index, chunk) in chunks {
        if let ChunkOutcome::Complete(bytes) =
            reassembler.receive("bench-peer", "bench", *index, total, chunk.clone())
        {
            done = Some(bytes);
        }
    }
    done
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");

    for (name, size) in SIZES {
        let chunks: Vec<(u32, Bytes)> = split_payload(&payload(size), CHUNK_SIZE)
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| (i as u32, chunk))
            .collect();
        let total = chunks.len() as u32;
        let mut reversed = chunks.clone();
        reversed.reverse();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("in_order", name), &chunks, |b, chunks| {
            b.iter(|| reassemble(black_box(chunks), total))
        });
        group.bench_with_input(BenchmarkId::new("reversed", name), &reversed, |b, chunks| {
            b.iter(|| reassemble(black_box(chunks), total))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_codec");
    let data = payload(1024 * 1024);
    let frames: Vec<_> = transfer_messages("bench-peer", "bench", &data, CHUNK_SIZE)
        .iter()
        .filter(|m| matches!(m.body, MessageBody::ImageChunk { .. }))
        .flat_map(|m| m.encode().expect("encode chunk"))
        .collect();

    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("decode_1MB", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut decoded = 0usize;
            for frame in frames.iter().cloned() {
                if let Ok(Some(_)) = decoder.push(black_box(frame)) {
                    decoded += 1;
                }
            }
            decoded
        })
    });

    group.finish();
}

criterion_group!(benches, bench_split, bench_reassembly, bench_codec);
criterion_main!(benches);
