use criterion::{black_box, criterion_group, criterion_main, Criterion};
use l4proxier::net::{Protocol, Service};
use l4proxier::LoadBalancer;
use std::collections::HashMap;
use std::sync::Arc;

fn load_balancer_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer");

    let lb = LoadBalancer::new();
    let mut table = HashMap::new();
    table.insert(
        "echo".to_string(),
        vec![
            "10.0.0.1:9000".to_string(),
            "10.0.0.2:9000".to_string(),
            "10.0.0.3:9000".to_string(),
            "10.0.0.4:9000".to_string(),
        ],
    );
    lb.on_update(table);

    group.bench_function("next_endpoint_4_backends", |b| {
        b.iter(|| black_box(lb.next_endpoint("echo").unwrap()))
    });

    let lb = Arc::new(lb);
    group.bench_function("next_endpoint_contended_8_threads", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..8 {
                    let lb = Arc::clone(&lb);
                    scope.spawn(move || {
                        for _ in 0..64 {
                            black_box(lb.next_endpoint("echo").unwrap());
                        }
                    });
                }
            });
        })
    });

    group.bench_function("on_update_replaces_table", |b| {
        b.iter(|| {
            let mut table = HashMap::new();
            table.insert(
                "echo".to_string(),
                vec!["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()],
            );
            black_box(lb.on_update(table));
        })
    });

    group.finish();
}

fn proxier_reconciliation_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("proxier_reconciliation");
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("on_update_idempotent_100_services", |b| {
        let proxier = rt.block_on(async {
            let balancer = Arc::new(LoadBalancer::new());
            let proxier =
                l4proxier::Proxier::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), balancer);
            let desired: Vec<Service> = (0..100)
                .map(|i| Service::new(format!("svc-{i}"), 20000 + i as u16, Protocol::Tcp))
                .collect();
            proxier.on_update(desired).await.unwrap();
            proxier
        });

        let desired: Vec<Service> = (0..100)
            .map(|i| Service::new(format!("svc-{i}"), 20000 + i as u16, Protocol::Tcp))
            .collect();

        b.iter(|| {
            rt.block_on(async { black_box(proxier.on_update(desired.clone()).await.unwrap()) });
        });
    });

    group.finish();
}

criterion_group!(benches, load_balancer_benchmark, proxier_reconciliation_benchmark);
criterion_main!(benches);
