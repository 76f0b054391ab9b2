//! Request round trips through the dispatcher against an in-memory server.

use antidote_client::transport;
use antidote_client::{Connection, ConnectionConfig};
use antidote_protocol::{decode_request, Encoder, Request, Response, TransactionDescriptor};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Answers every request with a successful start-transaction response.
fn setup(rt: &Runtime) -> Arc<Connection> {
    rt.block_on(async {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut reader, mut writer) = transport::split(server, antidote_protocol::MAX_FRAME_SIZE);
        let reply = Encoder::encode_response(&Response::StartTransaction(Ok(
            TransactionDescriptor::new(vec![1u8; 32]),
        )))
        .unwrap();

        tokio::spawn(async move {
            while let Ok(Some(frame)) = reader.receive().await {
                let _ = decode_request(frame);
                if writer.send(&reply).await.is_err() {
                    break;
                }
            }
        });

        Arc::new(Connection::from_stream(client, ConnectionConfig::default()))
    })
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let conn = setup(&rt);
    let request = Request::StartTransaction { timestamp: None };

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("round_trip", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(conn.request(&request).await.unwrap()) });
    });

    group.bench_function("queued_8", |b| {
        b.to_async(&rt).iter(|| async {
            let calls = (0..8).map(|_| {
                let conn = conn.clone();
                let request = request.clone();
                tokio::spawn(async move { conn.request(&request).await.unwrap() })
            });
            for call in calls.collect::<Vec<_>>() {
                black_box(call.await.unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
