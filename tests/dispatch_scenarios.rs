use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rustsweep::address::{expand_targets, ExpandOptions, Resolve};
use rustsweep::error::{ConfigError, ScanError};
use rustsweep::input::ScanOptions;
use rustsweep::scanner::concurrency::ConcurrencyMode;
use rustsweep::scanner::preflight::Dialer;
use rustsweep::scanner::progress::Progress;
use rustsweep::scanner::rate_limit::RateLimiter;
use rustsweep::scanner::{
    Engine, FnProbe, Probe, ProbeOutcome, RunSummary, ScanHandle, ScanRequest, ScanResult,
    ScanTask,
};
use tokio::time::Instant;

#[derive(Default)]
struct TableResolver(HashMap<String, Vec<IpAddr>>);

impl TableResolver {
    fn with(host: &str, addrs: &[&str]) -> Self {
        let mut table = HashMap::new();
        table.insert(host.to_owned(), addrs.iter().map(|a| a.parse().unwrap()).collect());
        Self(table)
    }
}

impl Resolve for TableResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        let answer = self
            .0
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"));
        async move { answer }.boxed()
    }
}

/// Answers only on the listed sockets.
#[derive(Default)]
struct ListDialer(Vec<SocketAddr>);

impl Dialer for ListDialer {
    fn dial(&self, addr: SocketAddr, _timeout: Duration) -> BoxFuture<'_, io::Result<()>> {
        let result = if self.0.contains(&addr) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        };
        async move { result }.boxed()
    }
}

fn unlimited(ports: &str) -> ScanOptions {
    ScanOptions {
        ports: Some(ports.to_owned()),
        mode: Some(ConcurrencyMode::Manual),
        threads: Some(8),
        max_pps: Some(0),
        per_ip_max_pps: Some(0),
        ..ScanOptions::default()
    }
}

fn request(targets: &[&str], options: ScanOptions) -> ScanRequest {
    ScanRequest {
        options,
        ..ScanRequest::new(targets.iter().copied())
    }
}

fn instant_open() -> Arc<dyn Probe> {
    Arc::new(FnProbe(|_task: ScanTask| async {
        ProbeOutcome::open(Duration::from_millis(1))
    }))
}

/// Drains everything a run produces.
async fn collect(handle: ScanHandle) -> (Vec<ScanResult>, Vec<Progress>, RunSummary) {
    let (mut results, mut progress, control) = handle.into_parts();
    let mut open = Vec::new();
    while let Some(result) = results.recv().await {
        open.push(result);
    }
    let summary = control.finish().await.unwrap();
    let mut snapshots = Vec::new();
    while let Some(snapshot) = progress.recv().await {
        snapshots.push(snapshot);
    }
    (open, snapshots, summary)
}

#[tokio::test]
async fn four_addresses_two_ports_make_eight_tasks() {
    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/30"], unlimited("80,443")), instant_open())
        .await
        .unwrap();

    let (open, snapshots, summary) = collect(handle).await;
    let last = snapshots.last().unwrap();

    assert_eq!(open.len(), 8);
    assert_eq!((last.planned, last.enqueued, last.started), (8, 8, 8));
    assert_eq!((last.succeeded, last.active), (8, 0));
    assert_eq!((summary.generated, summary.submitted, summary.abandoned), (8, 8, 0));
    assert!(snapshots
        .windows(2)
        .all(|pair| pair[0].started <= pair[1].started && pair[0].enqueued <= pair[1].enqueued));
}

#[tokio::test]
async fn private_target_is_refused_up_front() {
    let engine = Engine::default();
    let err = engine
        .run(&request(&["10.0.0.1"], unlimited("80")), instant_open())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::TargetNotAllowed(_)));

    let allowed = ScanOptions {
        allow_private: Some(true),
        ..unlimited("80")
    };
    assert_eq!(
        engine
            .estimate_workload(&request(&["10.0.0.1"], allowed))
            .await
            .unwrap()
            .addresses,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn global_rate_paces_the_run() {
    let engine = Engine::default();
    let options = ScanOptions {
        max_pps: Some(2),
        ..unlimited("1-10")
    };
    let started = Instant::now();
    let handle = engine
        .run(&request(&["203.0.113.1"], options), instant_open())
        .await
        .unwrap();

    let (open, _, summary) = collect(handle).await;
    assert_eq!(open.len(), 10);
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(summary.deferrals > 0);
}

#[tokio::test]
async fn unreachable_address_never_reaches_the_pool() {
    let alive: IpAddr = "203.0.113.9".parse().unwrap();
    let probed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&probed);
    let probe = Arc::new(FnProbe(move |task: ScanTask| {
        seen.lock().unwrap().push(task.address);
        async { ProbeOutcome::closed("connection refused", Duration::from_millis(1)) }
    }));
    let options = ScanOptions {
        preflight_enabled: Some(true),
        preflight_ports: Some(String::from("80")),
        ..unlimited("22,80,443")
    };

    let engine = Engine::default();
    let handle = engine
        .run_with_dialer(
            &request(&["203.0.113.1", "203.0.113.9"], options),
            probe,
            Arc::new(ListDialer(vec![SocketAddr::new(alive, 80)])),
        )
        .await
        .unwrap();

    let (_, snapshots, summary) = collect(handle).await;
    assert!(probed.lock().unwrap().iter().all(|addr| *addr == alive));
    assert_eq!(probed.lock().unwrap().len(), 3);
    assert_eq!((summary.preflight_rejected, summary.unreachable_addresses), (3, 1));
    assert_eq!(summary.submitted, 3);

    let last = snapshots.last().unwrap();
    assert_eq!((last.failed, last.started, last.enqueued), (6, 6, 3));
}

#[tokio::test]
async fn excluding_outside_addresses_changes_nothing() {
    let engine = Engine::default();
    let mut with_exclude = request(&["203.0.113.0/30"], unlimited("80"));
    with_exclude.excludes = vec![String::from("198.51.100.0/24")];
    let plain = request(&["203.0.113.0/30"], unlimited("80"));

    assert_eq!(
        engine.estimate_workload(&with_exclude).await.unwrap(),
        engine.estimate_workload(&plain).await.unwrap()
    );

    with_exclude.excludes.push(String::from("203.0.113.0/31"));
    assert_eq!(engine.estimate_workload(&with_exclude).await.unwrap().addresses, 2);

    with_exclude.excludes.push(String::from("203.0.113.2/31"));
    assert!(matches!(
        engine.estimate_workload(&with_exclude).await,
        Err(ConfigError::NoTargetsAfterExclude)
    ));
}

#[tokio::test]
async fn expansion_is_deterministic() {
    let resolver = TableResolver::default();
    let targets: Vec<String> = ["203.0.113.64/27", "198.51.100.7", "203.0.113.0/26"]
        .iter()
        .map(|t| (*t).to_owned())
        .collect();
    let excludes = vec![String::from("203.0.113.10")];
    let opts = ExpandOptions::default();

    let first = expand_targets(&targets, &excludes, &opts, &resolver).await.unwrap();
    let second = expand_targets(&targets, &excludes, &opts, &resolver).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.address_count(), 1 + 64 + 32 - 1);
}

#[tokio::test]
async fn hostnames_follow_their_results() {
    let engine = Engine::default().with_resolver(Arc::new(TableResolver::with(
        "app.example",
        &["203.0.113.50"],
    )));
    let options = ScanOptions {
        resolve_hosts: Some(true),
        worker: Some(String::from("  edge-1 ")),
        ..unlimited("443")
    };
    let handle = engine
        .run(&request(&["app.example"], options), instant_open())
        .await
        .unwrap();

    let (open, _, _) = collect(handle).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].host.as_deref(), Some("app.example"));
    assert_eq!(open[0].worker.as_deref(), Some("edge-1"));
    assert_eq!(open[0].bindings[0].ip, "203.0.113.50".parse::<IpAddr>().unwrap());
}

#[tokio::test(start_paused = true)]
async fn auto_pool_stays_within_bounds_under_errors() {
    let failing = Arc::new(FnProbe(|_task: ScanTask| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ProbeOutcome::closed("connection refused", Duration::ZERO)
    }));
    let options = ScanOptions {
        mode: Some(ConcurrencyMode::Auto),
        threads: None,
        max_threads: Some(16),
        ..unlimited("1-64")
    };

    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/28"], options), failing)
        .await
        .unwrap();
    let (_, _, summary) = collect(handle).await;

    assert_eq!(summary.failed, 1024);
    assert!((8..=16).contains(&summary.final_capacity), "{}", summary.final_capacity);
}

#[tokio::test]
async fn cancellation_accounts_for_every_task() {
    let slow = Arc::new(FnProbe(|_task: ScanTask| async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        ProbeOutcome::closed("i/o timeout", Duration::ZERO)
    }));
    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/28"], unlimited("1-100")), slow)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.cancel();
    let summary = handle.finish().await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.abandoned > 0);
    assert_eq!(summary.submitted + summary.abandoned, summary.generated);
    assert_eq!(summary.timed_out, summary.submitted);
    assert!(matches!(summary.into_result(), Err(ScanError::Cancelled)));
}

#[tokio::test]
async fn wait_reports_cancellation_as_an_error() {
    let slow = Arc::new(FnProbe(|_task: ScanTask| async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        ProbeOutcome::open(Duration::ZERO)
    }));
    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/28"], unlimited("1-100")), slow)
        .await
        .unwrap();
    handle.cancel();
    assert!(matches!(handle.wait().await, Err(ScanError::Cancelled)));
}

#[tokio::test]
async fn panicking_probe_counts_as_failed() {
    let probe = Arc::new(FnProbe(|task: ScanTask| async move {
        assert!(task.port != 443, "probe blew up on {}", task.port);
        ProbeOutcome::open(Duration::from_millis(1))
    }));
    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/30"], unlimited("80,443")), probe)
        .await
        .unwrap();

    let (open, snapshots, summary) = collect(handle).await;
    assert_eq!(open.len(), 4);
    assert!(open.iter().all(|result| result.port == 80));
    assert_eq!((summary.succeeded, summary.failed, summary.submitted), (4, 4, 8));
    assert_eq!(snapshots.last().unwrap().active, 0);
}

#[tokio::test]
async fn panic_before_the_future_exists_counts_as_failed() {
    let probe = Arc::new(FnProbe(|task: ScanTask| {
        assert!(task.port != 443, "no future for {}", task.port);
        async { ProbeOutcome::open(Duration::from_millis(1)) }
    }));
    let engine = Engine::default();
    let handle = engine
        .run(&request(&["203.0.113.0/30"], unlimited("80,443")), probe)
        .await
        .unwrap();

    let (open, snapshots, summary) = collect(handle).await;
    assert_eq!(open.len(), 4);
    assert_eq!((summary.succeeded, summary.failed, summary.submitted), (4, 4, 8));
    assert_eq!(
        summary.succeeded + summary.failed + summary.timed_out,
        summary.submitted
    );

    let last = snapshots.last().unwrap();
    assert_eq!((last.started, last.failed, last.active), (8, 4, 0));
}

#[tokio::test(start_paused = true)]
async fn batches_above_burst_respect_the_rate() {
    let limiter = RateLimiter::new(4, 0).unwrap();
    let burst = limiter.global().unwrap().capacity();
    let started = Instant::now();
    let mut granted = 0u32;

    while started.elapsed() < Duration::from_secs(10) {
        if limiter.reserve("203.0.113.1".parse().unwrap(), 8).is_granted() {
            granted += 8;
        }
        tokio::time::advance(Duration::from_millis(250)).await;
    }

    assert!(f64::from(granted) <= 4.0 * 10.0 + burst, "{granted} permits in 10s");
    assert!(granted > 0);
}
