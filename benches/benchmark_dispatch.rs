use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rustsweep::address::{expand_targets, ExpandOptions, SystemResolver};
use rustsweep::input::parse_port_spec;
use rustsweep::scanner::rate_limit::RateLimiter;
use std::net::IpAddr;

fn bench_reserve(c: &mut Criterion) {
    let limiter = RateLimiter::new(u32::MAX, u32::MAX).unwrap();
    let destinations: Vec<IpAddr> = (0..=255u8)
        .map(|last| IpAddr::from([203, 0, 113, last]))
        .collect();

    c.bench_function("reserve_spread_destinations", |b| {
        let mut next = destinations.iter().cycle();
        b.iter(|| limiter.reserve(black_box(*next.next().unwrap()), 1));
    });
}

fn bench_expand(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let resolver = rt.block_on(SystemResolver::new(None));
    let targets: Vec<String> = (0..64)
        .map(|block| format!("198.51.{block}.0/24"))
        .chain(["203.0.113.0/24".to_owned()])
        .collect();
    let excludes: Vec<String> = (0..64).map(|block| format!("198.51.{block}.128/26")).collect();
    let opts = ExpandOptions::default();

    c.bench_function("expand_overlapping_targets", |b| {
        b.iter(|| {
            rt.block_on(expand_targets(
                black_box(&targets),
                black_box(&excludes),
                &opts,
                &resolver,
            ))
            .unwrap()
        });
    });
}

fn bench_port_spec(c: &mut Criterion) {
    c.bench_function("parse_full_port_range", |b| {
        b.iter(|| parse_port_spec(black_box("1-65535")).unwrap());
    });
    c.bench_function("parse_mixed_port_list", |b| {
        b.iter(|| parse_port_spec(black_box("22,80,443,1000-2000,8080,8443,top1000")));
    });
}

criterion_group!(benches, bench_reserve, bench_expand, bench_port_spec);
criterion_main!(benches);
