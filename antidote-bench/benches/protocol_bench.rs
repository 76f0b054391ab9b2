//! Protocol encoding/decoding benchmarks.

use antidote_protocol::frame::Frame;
use antidote_protocol::{
    BoundObject, CommitTime, CrdtType, Decoder, Encoder, MapKey, MapOp, Operation, Request,
    Response, TransactionDescriptor, Update, Value,
};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;

fn descriptor() -> TransactionDescriptor {
    TransactionDescriptor::new(vec![0xab; 64])
}

fn create_update_request(count: usize) -> Request {
    let updates = (0..count)
        .map(|i| {
            let object = BoundObject::new(format!("key-{}", i), CrdtType::AwSet, "bench").unwrap();
            Update::new(object, Operation::add_all(["alpha", "beta", "gamma"])).unwrap()
        })
        .collect();
    Request::UpdateObjects {
        updates,
        descriptor: descriptor(),
    }
}

fn create_map_request() -> Request {
    let mut op = MapOp::new();
    for i in 0..32 {
        op = op.update(
            MapKey::new(format!("field-{}", i), CrdtType::Counter).unwrap(),
            Operation::increment(i),
        );
    }
    let object = BoundObject::new("profile", CrdtType::RrMap, "bench").unwrap();
    Request::UpdateObjects {
        updates: vec![Update::new(object, op).unwrap()],
        descriptor: descriptor(),
    }
}

fn create_read_response(count: usize) -> Response {
    let values = (0..count)
        .map(|i| {
            let mut entries = BTreeMap::new();
            entries.insert(
                MapKey::new("visits", CrdtType::Counter).unwrap(),
                Value::Counter(i as i64 * 1000),
            );
            entries.insert(
                MapKey::new("name", CrdtType::LwwRegister).unwrap(),
                Value::Register(Bytes::from(format!("user-{}", i))),
            );
            Value::Map(entries)
        })
        .collect();
    Response::ReadObjects(Ok(values))
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(
            antidote_protocol::MessageCode::ReadObjectsResp,
            Bytes::from(vec![0x42u8; size]),
        );

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(
            antidote_protocol::MessageCode::ReadObjectsResp,
            Bytes::from(vec![0x42u8; size]),
        );
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for count in [1, 10, 100] {
        let request = create_update_request(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &request, |b, request| {
            b.iter(|| black_box(Encoder::encode_request(request).unwrap()));
        });
    }

    let request = create_map_request();
    group.bench_function("map_32_fields", |b| {
        b.iter(|| black_box(Encoder::encode_request(&request).unwrap()));
    });

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");

    for count in [1, 10, 100] {
        let encoded = Encoder::encode_request(&create_update_request(count)).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_request().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");

    for count in [1, 10, 100] {
        let encoded = Encoder::encode_response(&create_read_response(count)).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_response().unwrap())
            });
        });
    }

    let commit = Encoder::encode_response(&Response::Commit(Ok(CommitTime::new(vec![7u8; 48]))))
        .unwrap();
    group.bench_function("commit", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.extend(&commit);
            black_box(decoder.decode_response().unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_request_encode,
    bench_request_decode,
    bench_response_decode,
);
criterion_main!(benches);
