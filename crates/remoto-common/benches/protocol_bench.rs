// Criterion benchmarks for the remoto-common message codec
//
// Run benchmarks with:
//   cargo bench -p remoto-common
//
// For detailed output with plots:
//   cargo bench -p remoto-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use remoto_common::{
    serializer_for_id, AnnotationKey, Annotations, Config, Flags, Message, MessageType, WireConfig,
    JSON_SERIALIZER_ID,
};
use serde_json::{json, Map};

fn invoke_message(payload_len: usize) -> Message {
    let mut annotations = Annotations::new();
    annotations.insert(AnnotationKey(*b"CORR"), vec![0x5a; 16]);
    Message::new(
        MessageType::Invoke,
        vec![b'x'; payload_len],
        JSON_SERIALIZER_ID,
        Flags::NONE,
        1,
    )
    .with_annotations(annotations)
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");
    let plain = WireConfig::default();
    let keyed = WireConfig::from(&Config::default().with_auth_secret("bench-secret"));

    for size in [64usize, 4096, 65536] {
        let msg = invoke_message(size);
        group.bench_function(format!("plain_{}", size), |b| {
            b.iter(|| black_box(&msg).encode(black_box(&plain)))
        });
        group.bench_function(format!("authenticated_{}", size), |b| {
            b.iter(|| black_box(&msg).encode(black_box(&keyed)))
        });
    }

    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");
    let plain = WireConfig::default();
    let keyed = WireConfig::from(&Config::default().with_auth_secret("bench-secret"));

    for size in [64usize, 4096, 65536] {
        let msg = invoke_message(size);
        let plain_bytes = msg.encode(&plain).unwrap();
        let keyed_bytes = msg.encode(&keyed).unwrap();
        group.bench_function(format!("plain_{}", size), |b| {
            b.iter(|| Message::decode(black_box(&plain_bytes), black_box(&plain)))
        });
        group.bench_function(format!("authenticated_{}", size), |b| {
            b.iter(|| Message::decode(black_box(&keyed_bytes), black_box(&keyed)))
        });
    }

    group.finish();
}

fn bench_call_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_serialization");
    let serializer = serializer_for_id(JSON_SERIALIZER_ID).unwrap();
    let args = vec![json!(6), json!(7), json!({"values": [1, 2, 3, 4, 5]})];
    let kwargs = Map::new();

    group.bench_function("dumps_call", |b| {
        b.iter(|| serializer.dumps_call(black_box("obj_1"), black_box("multiply"), &args, &kwargs))
    });

    let data = serializer.dumps_call("obj_1", "multiply", &args, &kwargs).unwrap();
    group.bench_function("loads_call", |b| b.iter(|| serializer.loads_call(black_box(&data))));

    group.finish();
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_call_serialization
);
criterion_main!(benches);
