//! Benchmarks for session dispatch and the wire codec

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mcp_relay::mcp::{codec, Message, Notification, Request, RequestId};
use mcp_relay::server::sample::{sample_server, StaticFetcher};
use mcp_relay::transport::MemoryTransport;
use mcp_relay::{McpClient, SessionManager};
use serde_json::json;
use tokio::runtime::Runtime;

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    let request: Message = Request::new(42_i64, "resources/read", json!({"uri": "file:///greeting.txt"})).into();
    let encoded = codec::encode(&request).unwrap();
    group.bench_function("encode_request", |b| {
        b.iter(|| codec::encode(black_box(&request)).unwrap())
    });
    group.bench_function("decode_request", |b| {
        b.iter(|| codec::decode(black_box(&encoded)).unwrap())
    });

    let note: Message = Notification::new(
        "notifications/message",
        json!({"level": "info", "logger": "bench", "data": "subscribe_resource"}),
    )
    .related_to(RequestId::Number(7))
    .into();
    let encoded_note = codec::encode(&note).unwrap();
    group.bench_function("decode_related_notification", |b| {
        b.iter(|| codec::decode(black_box(&encoded_note)).unwrap())
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (client, _manager) = rt.block_on(async {
        let server = sample_server(Arc::new(StaticFetcher::new("bench"))).unwrap();
        let manager = SessionManager::new(Arc::new(server));
        let (a, b) = MemoryTransport::pair();
        manager.open(Arc::new(b));
        let client = McpClient::connect(Arc::new(a));
        client.initialize("bench").await.unwrap();
        (client, manager)
    });

    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt).iter(|| async { client.ping().await.unwrap() })
    });
    group.bench_function("read_resource", |b| {
        b.to_async(&rt)
            .iter(|| async { client.read_resource("file:///greeting.txt").await.unwrap() })
    });

    for concurrency in [1usize, 8, 32] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("concurrent_list_tools", concurrency),
            &concurrency,
            |b, &n| {
                b.to_async(&rt).iter(|| async {
                    let calls = (0..n).map(|_| client.list_tools());
                    futures::future::join_all(calls).await
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_round_trip);
criterion_main!(benches);
