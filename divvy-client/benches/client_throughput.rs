use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use divvy_client::DivvyClient;
use divvy_client::protocol::{self, HitRequest};
use futures::future::join_all;
use std::hint::black_box;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

/// Minimal divvy server that allows everything
async fn spawn_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    if write_half.write_all(b"OK true 575 60\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    port
}

fn sample_request() -> HitRequest {
    HitRequest::new()
        .field("type", "benchmark")
        .field("ip", "10.24.117.3")
        .field("path", "/api/v1/items")
}

fn benchmark_codec(c: &mut Criterion) {
    let request = sample_request();
    let mut group = c.benchmark_group("codec");

    group.bench_function("encode", |b| {
        b.iter(|| protocol::encode(black_box(&request)).unwrap())
    });
    group.bench_function("decode_decision", |b| {
        b.iter(|| protocol::decode(black_box(b"OK true 575 60\n")).unwrap())
    });
    group.bench_function("decode_fault", |b| {
        b.iter(|| protocol::decode(black_box(b"ERR unknown \"quota store offline\"\n")).unwrap())
    });

    group.finish();
}

fn benchmark_single_request(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(async {
        let port = spawn_server().await;
        DivvyClient::connect("127.0.0.1", port).await.unwrap()
    });
    let request = sample_request();

    c.bench_function("client_single_request", |b| {
        b.to_async(&rt)
            .iter(|| async { client.check_rate_limit(&request).await.unwrap() });
    });
}

fn benchmark_pipelined(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(async {
        let port = spawn_server().await;
        DivvyClient::connect("127.0.0.1", port).await.unwrap()
    });
    let request = sample_request();

    let mut group = c.benchmark_group("client_pipelined");
    for concurrency in [10, 100, 1000] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async {
                    let requests = (0..concurrency).map(|_| client.check_rate_limit(&request));
                    for result in join_all(requests).await {
                        result.unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_codec,
    benchmark_single_request,
    benchmark_pipelined
);
criterion_main!(benches);
