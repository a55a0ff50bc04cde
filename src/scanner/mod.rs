//! Core functionality for actual scanning behaviour.
//!
//! An [`Engine`] validates a [`ScanRequest`], expands its targets and hands
//! the resulting plan to the dispatcher, which runs one [`Probe`] per
//! (address, port) pair under the concurrency and rate limits of the run.
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZero;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use serde_derive::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::address::{expand_targets, Resolve, SystemResolver};
use crate::error::{ConfigError, ScanError};
use crate::input::{normalize_targets, resolve, ScanOptions};

pub mod concurrency;
mod dispatch;
pub mod preflight;
pub mod progress;
pub mod rate_limit;
pub mod stats;

use dispatch::RunPlan;
use preflight::{Dialer, TcpDialer};
use progress::Progress;

/// Open results buffered before workers start waiting on the caller.
pub const RESULT_BUFFER: usize = 64;

/// One (address, port) unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub address: IpAddr,
    pub port: u16,
    /// Hostnames that led to `address`, possibly empty.
    pub hostnames: Arc<[String]>,
}

impl ScanTask {
    pub fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// What a [`Probe`] reports back for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub open: bool,
    /// Free-form. Only inspected for timeout-like wording.
    pub status: String,
    /// Zero means "not measured"; the dispatcher then times the call itself.
    pub duration: Duration,
}

impl ProbeOutcome {
    pub fn open(duration: Duration) -> Self {
        Self {
            open: true,
            status: String::from("open"),
            duration,
        }
    }

    pub fn closed(status: impl Into<String>, duration: Duration) -> Self {
        Self {
            open: false,
            status: status.into(),
            duration,
        }
    }
}

/// Decides whether one port is open.
pub trait Probe: Send + Sync {
    fn probe<'a>(&'a self, task: &'a ScanTask) -> BoxFuture<'a, ProbeOutcome>;
}

/// Adapts a plain async closure into a [`Probe`].
pub struct FnProbe<F>(pub F);

impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn(ScanTask) -> Fut + Send + Sync,
    Fut: Future<Output = ProbeOutcome> + Send + 'static,
{
    fn probe<'a>(&'a self, task: &'a ScanTask) -> BoxFuture<'a, ProbeOutcome> {
        (self.0)(task.clone()).boxed()
    }
}

impl<F> fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProbe")
    }
}

/// Full TCP connect, retried `tries` times.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
    tries: NonZero<u8>,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration, tries: u8) -> Self {
        Self {
            timeout,
            tries: NonZero::new(tries).unwrap_or(NonZero::<u8>::MIN),
        }
    }

    /// Given a socket, scan it self.tries times.
    /// Returns as soon as one attempt connects. Otherwise the outcome carries
    /// the last error, so a connect that ran into `self.timeout` reads as a
    /// timeout and anything else as a plain failure.
    async fn scan_socket(&self, socket: SocketAddr) -> ProbeOutcome {
        let started = Instant::now();
        let mut last_err = String::new();

        for nr_try in 1..=self.tries.get() {
            match self.connect(socket).await {
                Ok(tcp_stream) => {
                    debug!("Connection was successful, shutting down stream {socket}");
                    if let Err(e) = { tcp_stream }.shutdown().await {
                        debug!("Shutdown stream error {e}");
                    }
                    debug!("Return Ok after {nr_try} tries");
                    return ProbeOutcome::open(started.elapsed());
                }
                Err(e) => {
                    let error_string = e.to_string();
                    if error_string.to_lowercase().contains("too many open files") {
                        warn!("Too many open files. Lower --threads or raise the limit with --ulimit.");
                    }
                    last_err = error_string;
                }
            }
        }

        ProbeOutcome::closed(last_err, started.elapsed())
    }

    /// Performs the connection to the socket with timeout.
    async fn connect(&self, socket: SocketAddr) -> std::io::Result<TcpStream> {
        time::timeout(self.timeout, TcpStream::connect(socket))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
    }
}

impl Probe for TcpConnectProbe {
    fn probe<'a>(&'a self, task: &'a ScanTask) -> BoxFuture<'a, ProbeOutcome> {
        self.scan_socket(task.socket()).boxed()
    }
}

/// DNS record kind a hostname reached the address through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
}

/// A hostname paired with the address it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostBinding {
    pub host: String,
    pub ip: IpAddr,
    pub record_type: RecordType,
}

/// One open port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub address: IpAddr,
    pub port: u16,
    pub hostnames: Vec<String>,
    /// Set when exactly one hostname led here.
    pub host: Option<String>,
    pub bindings: Vec<HostBinding>,
    pub status: String,
    pub duration_ms: u64,
    pub worker: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ScanResult {
    pub(crate) fn new(
        task: &ScanTask,
        outcome: &ProbeOutcome,
        duration: Duration,
        worker: Option<&str>,
    ) -> Self {
        let record_type = if task.address.is_ipv4() {
            RecordType::A
        } else {
            RecordType::Aaaa
        };
        let bindings = task
            .hostnames
            .iter()
            .map(|host| HostBinding {
                host: host.clone(),
                ip: task.address,
                record_type,
            })
            .collect();

        Self {
            address: task.address,
            port: task.port,
            hostnames: task.hostnames.to_vec(),
            host: match &*task.hostnames {
                [only] => Some(only.clone()),
                _ => None,
            },
            bindings,
            status: outcome.status.clone(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            worker: worker.map(str::to_owned),
            timestamp: Utc::now(),
        }
    }

    pub fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Terminal accounting for one run.
///
/// Every task the target stream generated was either submitted to the
/// worker pool or abandoned on cancellation, so
/// `submitted + abandoned == generated` always holds. Ports of addresses
/// that failed preflight are never generated and are counted in
/// `preflight_rejected` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub planned: u64,
    pub generated: u64,
    pub submitted: u64,
    pub abandoned: u64,
    pub preflight_rejected: u64,
    pub unreachable_addresses: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub deferrals: u64,
    pub final_capacity: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl RunSummary {
    /// `Err(ScanError::Cancelled)` for a cancelled run.
    pub fn into_result(self) -> Result<Self, ScanError> {
        if self.cancelled {
            Err(ScanError::Cancelled)
        } else {
            Ok(self)
        }
    }
}

/// Targets, excludes and options for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    pub targets: Vec<String>,
    /// Extra targets, separated by newlines, commas or whitespace.
    pub targets_text: Option<String>,
    pub excludes: Vec<String>,
    pub options: ScanOptions,
}

impl ScanRequest {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Size of a run before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub addresses: u128,
    pub ports: usize,
    /// `addresses * ports`, saturating.
    pub probes: u64,
}

/// Cancels and awaits a running scan.
#[derive(Debug)]
pub struct RunControl {
    cancel: CancellationToken,
    join: JoinHandle<Result<RunSummary, ScanError>>,
}

impl RunControl {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run when triggered.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run and returns its accounting, cancelled or not.
    pub async fn finish(self) -> Result<RunSummary, ScanError> {
        self.join.await?
    }

    /// Like [`RunControl::finish`], but a cancelled run is
    /// `Err(ScanError::Cancelled)`.
    pub async fn wait(self) -> Result<RunSummary, ScanError> {
        self.finish().await?.into_result()
    }
}

/// A running scan.
///
/// `results` is bounded: a caller that keeps the receiver must drain it, or
/// workers holding open results stall until the run is cancelled.
#[derive(Debug)]
pub struct ScanHandle {
    pub results: mpsc::Receiver<ScanResult>,
    pub progress: mpsc::UnboundedReceiver<Progress>,
    control: RunControl,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.control.cancellation()
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<ScanResult>,
        mpsc::UnboundedReceiver<Progress>,
        RunControl,
    ) {
        (self.results, self.progress, self.control)
    }

    /// Discards outstanding results and progress, then waits for the run.
    pub async fn finish(self) -> Result<RunSummary, ScanError> {
        let (results, progress, control) = self.into_parts();
        drop(results);
        drop(progress);
        control.finish().await
    }

    pub async fn wait(self) -> Result<RunSummary, ScanError> {
        self.finish().await?.into_result()
    }
}

/// Owns the default options shared by every run.
///
/// Construct once and share. Runs are set up one at a time and then
/// execute concurrently.
pub struct Engine {
    defaults: RwLock<ScanOptions>,
    resolver: Option<Arc<dyn Resolve>>,
    setup: Mutex<()>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ScanOptions::standard())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("defaults", &self.defaults())
            .field("custom_resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(defaults: ScanOptions) -> Self {
        Self {
            defaults: RwLock::new(defaults),
            resolver: None,
            setup: Mutex::new(()),
        }
    }

    /// Uses `resolver` for every hostname instead of the system resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn defaults(&self) -> ScanOptions {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies to runs started afterwards.
    pub fn update_defaults(&self, defaults: ScanOptions) {
        *self
            .defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner) = defaults;
    }

    /// Validates `request` and reports how much work it would plan.
    pub async fn estimate_workload(
        &self,
        request: &ScanRequest,
    ) -> Result<Workload, ConfigError> {
        let plan = self.plan(request).await?;
        Ok(Workload {
            addresses: plan.expansion.address_count(),
            ports: plan.ports.len(),
            probes: plan.planned(),
        })
    }

    /// Validates `request` and starts the run, preflighting with
    /// [`TcpDialer`] when enabled.
    pub async fn run(
        &self,
        request: &ScanRequest,
        probe: Arc<dyn Probe>,
    ) -> Result<ScanHandle, ConfigError> {
        self.run_with_dialer(request, probe, Arc::new(TcpDialer)).await
    }

    /// Every validation error is returned here, before anything is scheduled.
    pub async fn run_with_dialer(
        &self,
        request: &ScanRequest,
        probe: Arc<dyn Probe>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<ScanHandle, ConfigError> {
        let plan = self.plan(request).await?;

        let (results_tx, results) = mpsc::channel(RESULT_BUFFER);
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(dispatch::execute(
            plan,
            probe,
            dialer,
            results_tx,
            progress_tx,
            cancel.clone(),
        ));

        Ok(ScanHandle {
            results,
            progress,
            control: RunControl { cancel, join },
        })
    }

    async fn plan(&self, request: &ScanRequest) -> Result<RunPlan, ConfigError> {
        let _setup = self.setup.lock().await;
        let options = resolve(&request.options, &self.defaults())?;

        let targets = normalize_targets(&request.targets, request.targets_text.as_deref());
        if targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let excludes = normalize_targets(&request.excludes, None);

        let expansion = if let Some(resolver) = &self.resolver {
            expand_targets(&targets, &excludes, &options.expand, resolver.as_ref()).await?
        } else {
            let resolver = SystemResolver::new(options.resolver.as_deref()).await;
            expand_targets(&targets, &excludes, &options.expand, &resolver).await?
        };

        Ok(RunPlan {
            expansion,
            ports: options.ports.into(),
            preflight: options.preflight,
            probe_timeout: options.probe_timeout,
            concurrency: options.concurrency,
            worker: options.worker.map(Into::into),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Engine, FnProbe, Probe, ProbeOutcome, RecordType, RunSummary, ScanRequest, ScanResult,
        ScanTask, TcpConnectProbe,
    };
    use crate::address::tests::StaticResolver;
    use crate::error::{ConfigError, ScanError};
    use crate::input::ScanOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn task(address: &str, port: u16, hostnames: &[&str]) -> ScanTask {
        ScanTask {
            address: address.parse().unwrap(),
            port,
            hostnames: hostnames.iter().map(|h| (*h).to_owned()).collect(),
        }
    }

    #[test]
    fn result_binds_every_hostname() {
        let outcome = ProbeOutcome::open(Duration::from_millis(12));
        let single = ScanResult::new(&task("203.0.113.9", 443, &["a.example"]), &outcome, outcome.duration, Some("w1"));
        assert_eq!(single.host.as_deref(), Some("a.example"));
        assert_eq!(single.bindings[0].record_type, RecordType::A);
        assert_eq!(single.duration_ms, 12);
        assert_eq!(single.worker.as_deref(), Some("w1"));

        let many = ScanResult::new(
            &task("2001:db8::1", 22, &["a.example", "b.example"]),
            &outcome,
            outcome.duration,
            None,
        );
        assert_eq!(many.host, None);
        assert_eq!(many.bindings.len(), 2);
        assert!(many.bindings.iter().all(|b| b.record_type == RecordType::Aaaa));
    }

    #[test]
    fn result_serializes_camel_case() {
        let outcome = ProbeOutcome::open(Duration::from_millis(3));
        let result = ScanResult::new(&task("203.0.113.9", 80, &["a.example"]), &outcome, outcome.duration, None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["durationMs"], 3);
        assert_eq!(json["bindings"][0]["recordType"], "A");
        assert_eq!(json["address"], "203.0.113.9");
    }

    #[test]
    fn cancelled_summary_is_an_error() {
        let done = RunSummary::default();
        assert!(done.clone().into_result().is_ok());
        let cancelled = RunSummary {
            cancelled: true,
            ..done
        };
        assert!(matches!(cancelled.into_result(), Err(ScanError::Cancelled)));
    }

    #[tokio::test]
    async fn fn_probe_sees_the_task() {
        let probe = FnProbe(|task: ScanTask| async move {
            if task.port == 443 {
                ProbeOutcome::open(Duration::ZERO)
            } else {
                ProbeOutcome::closed("refused", Duration::ZERO)
            }
        });
        assert!(probe.probe(&task("203.0.113.1", 443, &[])).await.open);
        assert!(!probe.probe(&task("203.0.113.1", 80, &[])).await.open);
    }

    #[tokio::test]
    async fn tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpConnectProbe::new(Duration::from_secs(1), 0);

        let outcome = probe.probe(&task("127.0.0.1", port, &[])).await;
        assert!(outcome.open);

        drop(listener);
        let outcome = probe.probe(&task("127.0.0.1", port, &[])).await;
        assert!(!outcome.open);
        assert!(!outcome.status.is_empty());
    }

    #[tokio::test]
    async fn estimate_counts_addresses_and_ports() {
        let engine = Engine::default().with_resolver(Arc::new(StaticResolver::with(
            "scan.example",
            &["203.0.113.20"],
        )));
        let mut request = ScanRequest::new(["203.0.113.0/30", "scan.example"]);
        request.options = ScanOptions {
            ports: Some(String::from("80,443,8080")),
            resolve_hosts: Some(true),
            ..ScanOptions::default()
        };

        let workload = engine.estimate_workload(&request).await.unwrap();
        assert_eq!((workload.addresses, workload.ports, workload.probes), (5, 3, 15));
    }

    #[tokio::test]
    async fn defaults_apply_to_later_runs() {
        let engine = Engine::default();
        let request = ScanRequest::new(["203.0.113.7"]);
        assert_eq!(engine.estimate_workload(&request).await.unwrap().ports, 4);

        engine.update_defaults(ScanOptions {
            ports: Some(String::from("1-10")),
            ..engine.defaults()
        });
        assert_eq!(engine.estimate_workload(&request).await.unwrap().ports, 10);
    }

    #[tokio::test]
    async fn validation_happens_before_spawn() {
        let engine = Engine::default();
        let probe: Arc<dyn Probe> = Arc::new(FnProbe(|_task: ScanTask| async {
            ProbeOutcome::open(Duration::ZERO)
        }));

        let empty = ScanRequest::new(Vec::<String>::new());
        assert!(matches!(engine.run(&empty, Arc::clone(&probe)).await, Err(ConfigError::NoTargets)));

        let mut bad_ports = ScanRequest::new(["203.0.113.1"]);
        bad_ports.options.ports = Some(String::from("80-"));
        assert!(matches!(
            engine.run(&bad_ports, Arc::clone(&probe)).await,
            Err(ConfigError::InvalidPorts(_))
        ));

        let loopback = ScanRequest::new(["127.0.0.1"]);
        assert!(matches!(
            engine.run(&loopback, probe).await,
            Err(ConfigError::TargetNotAllowed(_))
        ));
    }
}
