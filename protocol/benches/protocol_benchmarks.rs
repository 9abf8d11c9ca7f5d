//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Benchmarks for service protocol framing

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use relaymux_protocol::{Payloads, ServiceCodec, ServiceMessage};
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// Encoding Benchmarks
// ============================================================================

fn bench_encode_connection_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_connection_data");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut codec = ServiceCodec::new();
            let mut buffer = BytesMut::with_capacity(size + 64);
            let message = ServiceMessage::connection_data("conn-bench", vec![0x5A; size]);

            b.iter(|| {
                buffer.clear();
                codec.encode(black_box(&message), &mut buffer).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_encode_group_broadcast(c: &mut Criterion) {
    let mut payloads = Payloads::new();
    payloads.insert("json".to_string(), Bytes::from(vec![b'a'; 512]));
    payloads.insert("messagepack".to_string(), Bytes::from(vec![0x01; 384]));
    let message = ServiceMessage::GroupBroadcastData {
        group: "lobby".to_string(),
        excluded: (0..8).map(|i| format!("conn-{i}")).collect(),
        payloads,
    };

    c.bench_function("encode_group_broadcast", |b| {
        let mut codec = ServiceCodec::new();
        let mut buffer = BytesMut::with_capacity(2048);
        b.iter(|| {
            buffer.clear();
            codec.encode(black_box(&message), &mut buffer).unwrap();
        });
    });
}

// ============================================================================
// Decoding Benchmarks
// ============================================================================

fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream");

    for count in [1, 64, 1024].iter() {
        let mut codec = ServiceCodec::new();
        let mut encoded = BytesMut::new();
        for i in 0..*count {
            codec
                .encode(
                    ServiceMessage::connection_data(format!("conn-{i}"), vec![0u8; 128]),
                    &mut encoded,
                )
                .unwrap();
        }
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let mut codec = ServiceCodec::new();
                let mut buffer = encoded.clone();
                let mut decoded = 0;
                while let Some(message) = codec.decode(&mut buffer).unwrap() {
                    black_box(message);
                    decoded += 1;
                }
                decoded
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_connection_data,
    bench_encode_group_broadcast,
    bench_decode_stream
);
criterion_main!(benches);
