use criterion::{black_box, criterion_group, criterion_main, Criterion};

use async_trait::async_trait;
use redpool::backend::{self, Client, Connector, SharedConnector, Target};
use redpool::policy::Policy;
use redpool::registry::Registry;
use std::sync::Arc;

fn criterion_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 10", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(10)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 100", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(100)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently claim 1000", |b| {
        b.to_async(&rt).iter(|| concurrent_claims(black_box(1000)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

struct BenchClient {}

#[async_trait]
impl Client for BenchClient {
    async fn ping(&self) -> Result<(), backend::Error> {
        Ok(())
    }
}

struct BenchConnector {}

#[async_trait]
impl Connector for BenchConnector {
    type Client = BenchClient;

    async fn connect(&self, _target: &Target) -> Result<Self::Client, backend::Error> {
        Ok(BenchClient {})
    }
}

async fn concurrent_claims(count: usize) {
    let policy = Policy {
        initial_pools_per_node: 4,
        min_pools_per_node: 1,
        max_pools_per_node: 8,
        max_connection_size: 256,
        ..Policy::default()
    };
    let connector = Arc::new(BenchConnector {}) as SharedConnector<BenchClient>;
    let registry = Arc::new(Registry::new(connector, policy).unwrap());
    registry.add_node("redis://bench", None).await.unwrap();

    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let handle = registry.get_client("redis://bench", None).await.unwrap();
            handle.ping().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
