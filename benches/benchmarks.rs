//! Performance benchmarks for wsconn.
//!
//! Run with: `cargo bench`

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use http::HeaderMap;
use wsconn::connection::Negotiated;
use wsconn::extensions::deflate::{MessageDeflater, MessageInflater};
use wsconn::protocol::handshake::{parse_request_head, parse_response_head};
use wsconn::protocol::{
    Frame, MessageAssembler, OpCode, apply_mask, compute_accept_key, validate_utf8,
};
use wsconn::{Config, Connection, Message, Role, Upgrader};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn encoded_frame(payload_size: usize, mask: Option<[u8; 4]>) -> BytesMut {
    let frame = Frame::binary(vec![0xAB; payload_size]).with_mask(mask);
    let mut buf = BytesMut::with_capacity(frame.wire_size());
    frame.encode(&mut buf);
    buf
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    for (name, size) in [("10b", 10), ("1kb", 1024), ("64kb", 65536)] {
        let unmasked = encoded_frame(size, None);
        let masked = encoded_frame(size, Some(MASK));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("parse_{name}_unmasked"), |b| {
            b.iter(|| Frame::parse(black_box(&unmasked)))
        });
        group.bench_function(format!("parse_{name}_masked"), |b| {
            b.iter(|| Frame::parse(black_box(&masked)))
        });
        let frame = Frame::binary(vec![0xAB; size]).with_mask(Some(MASK));
        group.bench_function(format!("encode_{name}_masked"), |b| {
            let mut buf = BytesMut::with_capacity(frame.wire_size());
            b.iter(|| {
                buf.clear();
                black_box(&frame).encode(&mut buf);
            })
        });
    }

    group.finish();
}

fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("masking");

    for size in [64usize, 1024, 65536, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("apply_mask_{size}"), |b| {
            let mut data = vec![0xAB; size];
            b.iter(|| apply_mask(black_box(&mut data), MASK))
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");
    let ascii = "a".repeat(65536);
    let mixed = "héllo wörld ✓ 🦀 ".repeat(2048);

    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_64kb", |b| {
        b.iter(|| validate_utf8(black_box(ascii.as_bytes())))
    });
    group.throughput(Throughput::Bytes(mixed.len() as u64));
    group.bench_function("mixed", |b| {
        b.iter(|| validate_utf8(black_box(mixed.as_bytes())))
    });

    group.finish();
}

fn bench_deflate(c: &mut Criterion) {
    let mut group = c.benchmark_group("deflate");
    let text = "{\"type\":\"update\",\"id\":12345,\"values\":[1,2,3,4,5]}".repeat(256);
    let mut deflater = MessageDeflater::new(6);
    let compressed = deflater.compress(text.as_bytes()).unwrap();

    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("compress_json", |b| {
        let mut deflater = MessageDeflater::new(6);
        b.iter(|| deflater.compress(black_box(text.as_bytes())).unwrap())
    });
    group.bench_function("decompress_json", |b| {
        let mut inflater = MessageInflater::new();
        b.iter(|| inflater.decompress(black_box(&compressed), 1 << 20).unwrap())
    });

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    group.bench_function("compute_accept_key", |b| {
        b.iter(|| compute_accept_key(black_box(key)))
    });

    let request = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: http://server.example.com\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\
        \r\n";

    group.bench_function("parse_request", |b| {
        b.iter(|| parse_request_head(black_box(request)))
    });

    let upgrader = Upgrader::default()
        .with_subprotocols(["chat"])
        .with_compression(true);
    let (parsed, _) = parse_request_head(request).unwrap().unwrap();
    let host_headers = HeaderMap::new();
    group.bench_function("negotiate", |b| {
        b.iter(|| upgrader.negotiate(black_box(&parsed), &host_headers))
    });

    let response = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
        Sec-WebSocket-Protocol: chat\r\n\
        \r\n";
    group.bench_function("parse_response", |b| {
        b.iter(|| parse_response_head(black_box(response)))
    });

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(65536));

    let single = Frame::binary(vec![0xAB; 65536]);
    group.bench_function("single_frame_64kb", |b| {
        b.iter(|| {
            let mut assembler = MessageAssembler::new(1 << 20);
            assembler.push(black_box(&single)).unwrap()
        })
    });

    let fragments: Vec<Frame> = (0..8)
        .map(|i| {
            let opcode = if i == 0 { OpCode::Binary } else { OpCode::Continuation };
            Frame::new(i == 7, opcode, vec![0xAB; 8192])
        })
        .collect();
    group.bench_function("8_fragments_64kb", |b| {
        b.iter(|| {
            let mut assembler = MessageAssembler::new(1 << 20);
            let mut message = None;
            for frame in &fragments {
                message = assembler.push(black_box(frame)).unwrap();
            }
            message
        })
    });

    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("roundtrip");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for (name, compression) in [("plain", false), ("deflate", true)] {
        let (client, server) = runtime.block_on(async {
            let (a, b) = tokio::io::duplex(1 << 20);
            let negotiated = Negotiated {
                subprotocol: None,
                compression,
            };
            let client = Connection::from_parts(
                a,
                Role::Client,
                &Config::client(),
                negotiated.clone(),
                BytesMut::new(),
            );
            let server =
                Connection::from_parts(b, Role::Server, &Config::server(), negotiated, BytesMut::new());
            (client, server)
        });
        let payload = Message::text("x".repeat(4096));

        group.throughput(Throughput::Bytes(4096));
        group.bench_function(format!("text_4kb_{name}"), |b| {
            b.iter(|| {
                runtime.block_on(async {
                    client.write_message(payload.clone()).await.unwrap();
                    server.read_message().await.unwrap()
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frames,
    bench_masking,
    bench_utf8,
    bench_deflate,
    bench_handshake,
    bench_reassembly,
    bench_roundtrip
);

criterion_main!(benches);
