//! Worker-pool sizing, the inflight admission gate and the auto-tune loop.
//!
//! A [`ConcurrencyManager`] is built once per run. It decides the initial
//! pool size, owns the [`RateLimiter`] and [`ExecutionStats`], and in
//! [`ConcurrencyMode::Auto`] periodically resizes the [`WorkerPool`] from the
//! stats it collected.
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessExt, System, SystemExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::rate_limit::{RateLimiter, Reservation};
use super::stats::{ExecutionStats, StatsSnapshot};
use crate::error::ScanError;

/// Ports emitted for one address before moving to the next range.
pub const PORT_CHUNK_SIZE: usize = 8;
/// Floor of the auto-tuned pool.
pub const MIN_THREADS: usize = 8;
pub const TUNE_INTERVAL: Duration = Duration::from_secs(2);

const SHRINK_FACTOR: f64 = 0.7;
const GROW_STEP: usize = 64;
const SMALL_GROW_STEP: usize = 32;
const LOW_RTT: Duration = Duration::from_millis(50);
const CPU_CEILING: f64 = 85.0;
const ERROR_CEILING: f64 = 0.05;
const TIMEOUT_CEILING: f64 = 0.03;
const PPS_SMOOTHING: f64 = 0.3;
const PPS_SAMPLE_PERIOD: Duration = Duration::from_secs(1);
/// Rate assumed per manual worker when no global rate is configured.
const MANUAL_PPS_PER_THREAD: u32 = 20;
const FALLBACK_RATE_CEILING: u32 = 200;

#[cfg(target_os = "linux")]
const OS_THREAD_CEILING: usize = 4000;
#[cfg(not(target_os = "linux"))]
const OS_THREAD_CEILING: usize = 1000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// Elastic pool between a floor and a ceiling, tuned from observed load.
    #[default]
    Auto,
    /// Fixed worker count.
    Manual,
}

/// Concurrency settings after option resolution. Rates of `0` are disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyOptions {
    pub mode: ConcurrencyMode,
    pub threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub max_pps: u32,
    pub per_ip_max_pps: u32,
}

fn cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// `8 × cores`, at least 32, capped by the OS thread ceiling.
pub fn default_thread_count() -> usize {
    (cores() * 8).max(32).min(OS_THREAD_CEILING)
}

pub fn default_auto_max_threads() -> usize {
    (default_thread_count() * 2).clamp(128, 1024)
}

/// Soft limit on open file descriptors, if the platform has one.
pub fn fd_soft_limit() -> Option<u64> {
    #[cfg(unix)]
    {
        rlimit::getrlimit(rlimit::Resource::NOFILE)
            .ok()
            .map(|(soft, _)| soft)
            .filter(|soft| *soft > 0 && *soft != rlimit::INFINITY)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Quarter of the descriptor budget, never below 8.
pub fn fd_thread_cap(fd_soft: Option<u64>) -> Option<usize> {
    fd_soft.map(|fd| usize::try_from(fd / 4).unwrap_or(usize::MAX).max(8))
}

/// Size of the inflight gate.
///
/// The smallest of `rate × probe timeout`, `max_threads × chunk × 4` and half
/// the descriptor budget, floored at one chunk and then at
/// `min_threads × chunk`.
pub fn inflight_limit(
    rate_ceiling: u32,
    probe_timeout: Duration,
    max_threads: usize,
    fd_soft: Option<u64>,
    min_threads: usize,
) -> usize {
    let timeout_secs = if probe_timeout.is_zero() {
        2.0
    } else {
        probe_timeout.as_secs_f64()
    };

    let mut candidates = Vec::with_capacity(3);
    if rate_ceiling > 0 {
        let rate_cap = (f64::from(rate_ceiling) * timeout_secs) as usize;
        candidates.push(if rate_cap == 0 {
            rate_ceiling as usize
        } else {
            rate_cap
        });
    }
    let thread_cap = max_threads.saturating_mul(PORT_CHUNK_SIZE * 4);
    if thread_cap > 0 {
        candidates.push(thread_cap);
    }
    if let Some(fd_cap) = fd_soft.map(|fd| usize::try_from(fd / 2).unwrap_or(usize::MAX)) {
        if fd_cap > 0 {
            candidates.push(fd_cap);
        }
    }

    let limit = candidates
        .into_iter()
        .min()
        .unwrap_or(max_threads.saturating_mul(PORT_CHUNK_SIZE))
        .max(PORT_CHUNK_SIZE);
    limit.max(min_threads * PORT_CHUNK_SIZE)
}

/// The auto-tune policy, first matching rule wins:
/// shrink by 30% under CPU, error or timeout pressure; grow by 64 when the
/// backlog exceeds the pool; grow by 32 when round trips are fast and work
/// is waiting. The result is clamped to `[min, max]`.
pub fn tune_decision(
    current: usize,
    window: &StatsSnapshot,
    cpu_percent: f64,
    min: usize,
    max: usize,
) -> usize {
    let backlog = usize::try_from(window.backlog.max(0)).unwrap_or(usize::MAX);

    let desired = if cpu_percent > CPU_CEILING
        || window.error_rate() > ERROR_CEILING
        || window.timeout_rate() > TIMEOUT_CEILING
    {
        (current as f64 * SHRINK_FACTOR) as usize
    } else if backlog > current {
        current.saturating_add(GROW_STEP)
    } else if window.average_rtt() < LOW_RTT && backlog > 0 {
        current.saturating_add(SMALL_GROW_STEP)
    } else {
        current
    };

    desired.clamp(min, max)
}

/// A source of process load for the tuner.
pub trait LoadSampler: Send {
    /// Process CPU usage in percent of the whole machine.
    fn cpu_percent(&mut self) -> f64;
}

/// Samples this process through `sysinfo`.
pub struct ProcessCpu {
    system: System,
    pid: Option<Pid>,
    cores: f64,
}

impl ProcessCpu {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            cores: cores() as f64,
        }
    }
}

impl Default for ProcessCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for ProcessCpu {
    fn cpu_percent(&mut self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        if !self.system.refresh_process(pid) {
            return 0.0;
        }
        self.system
            .process(pid)
            .map_or(0.0, |process| f64::from(process.cpu_usage()) / self.cores)
    }
}

/// Fixed-capacity slots for probe tasks. Capacity may change while tasks run.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: AtomicUsize,
    tracker: TaskTracker,
}

/// Held by a running task. Returning it frees the worker.
#[derive(Debug)]
pub struct WorkerSlot(OwnedSemaphorePermit);

impl WorkerPool {
    pub fn new(capacity: usize) -> Result<Self, ScanError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(ScanError::Pool(format!(
                "capacity {capacity} outside 1..={}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            tracker: TaskTracker::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Tasks currently running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    pub fn try_slot(&self) -> Option<WorkerSlot> {
        Arc::clone(&self.slots).try_acquire_owned().ok().map(WorkerSlot)
    }

    /// Waits for a free worker. `None` once the pool has been shut down.
    pub async fn slot(&self) -> Option<WorkerSlot> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .ok()
            .map(WorkerSlot)
    }

    /// Runs `task` on the worker represented by `slot`.
    pub fn spawn<F>(&self, slot: WorkerSlot, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            let _slot = slot;
            task.await;
        });
    }

    /// Grows immediately. Shrinking takes idle slots now and the rest as
    /// running tasks finish.
    pub fn resize(&self, desired: usize) {
        let desired = desired.clamp(1, Semaphore::MAX_PERMITS);
        let current = self.capacity.swap(desired, Ordering::Relaxed);

        if desired > current {
            self.slots.add_permits(desired - current);
        } else if desired < current {
            let shrink = current - desired;
            let owed = shrink - self.slots.forget_permits(shrink);
            if owed > 0 {
                let slots = Arc::clone(&self.slots);
                let owed = u32::try_from(owed).unwrap_or(u32::MAX);
                tokio::spawn(async move {
                    if let Ok(permits) = slots.acquire_many_owned(owed).await {
                        permits.forget();
                    }
                });
            }
        }
    }

    /// Waits for every spawned task, then shuts the pool.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.slots.close();
    }
}

#[derive(Debug)]
struct PpsEstimate {
    last_total: u64,
    last_at: Option<Instant>,
    smoothed: f64,
}

/// Per-run concurrency state shared by the dispatcher, workers and tuner.
#[derive(Debug)]
pub struct ConcurrencyManager {
    mode: ConcurrencyMode,
    min_threads: usize,
    max_threads: usize,
    initial_workers: usize,
    inflight_limit: usize,
    limiter: Option<RateLimiter>,
    stats: ExecutionStats,
    gate: Arc<Semaphore>,
    permits_granted: AtomicU64,
    pps: Mutex<PpsEstimate>,
    started: Instant,
}

impl ConcurrencyManager {
    pub fn new(opts: &ConcurrencyOptions, probe_timeout: Duration) -> Self {
        Self::with_fd_limit(opts, probe_timeout, fd_soft_limit())
    }

    /// Same as [`ConcurrencyManager::new`] with an explicit descriptor limit.
    pub fn with_fd_limit(
        opts: &ConcurrencyOptions,
        probe_timeout: Duration,
        fd_soft: Option<u64>,
    ) -> Self {
        let fd_cap = fd_thread_cap(fd_soft);

        let (min_threads, max_threads, initial_workers) = match opts.mode {
            ConcurrencyMode::Manual => {
                let threads = opts.threads.filter(|t| *t > 0).unwrap_or_else(|| {
                    let baseline = default_thread_count();
                    fd_cap.map_or(baseline, |cap| baseline.min(cap))
                });
                (threads, threads, threads)
            }
            ConcurrencyMode::Auto => {
                let max = opts
                    .max_threads
                    .filter(|t| *t > 0)
                    .unwrap_or_else(default_auto_max_threads);
                let max = fd_cap.map_or(max, |cap| max.min(cap));
                let min = MIN_THREADS.min(max);
                (min, max, default_thread_count().clamp(min, max))
            }
        };

        let rate_ceiling = match (opts.max_pps, opts.mode) {
            (0, ConcurrencyMode::Manual) => u32::try_from(max_threads)
                .map_or(u32::MAX, |t| t.saturating_mul(MANUAL_PPS_PER_THREAD)),
            (0, ConcurrencyMode::Auto) => FALLBACK_RATE_CEILING,
            (rate, _) => rate,
        };
        let inflight_limit = inflight_limit(
            rate_ceiling,
            probe_timeout,
            max_threads,
            fd_soft,
            MIN_THREADS,
        )
        .min(Semaphore::MAX_PERMITS);

        info!(
            "Concurrency: mode {:?}, workers {} (min {}, max {}), inflight limit {}, max pps {}, per-ip pps {}",
            opts.mode,
            initial_workers,
            min_threads,
            max_threads,
            inflight_limit,
            opts.max_pps,
            opts.per_ip_max_pps
        );

        Self {
            mode: opts.mode,
            min_threads,
            max_threads,
            initial_workers,
            inflight_limit,
            limiter: RateLimiter::new(opts.max_pps, opts.per_ip_max_pps),
            stats: ExecutionStats::default(),
            gate: Arc::new(Semaphore::new(inflight_limit)),
            permits_granted: AtomicU64::new(0),
            pps: Mutex::new(PpsEstimate {
                last_total: 0,
                last_at: None,
                smoothed: 0.0,
            }),
            started: Instant::now(),
        }
    }

    pub const fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub const fn min_threads(&self) -> usize {
        self.min_threads
    }

    pub const fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub const fn initial_workers(&self) -> usize {
        self.initial_workers
    }

    pub const fn inflight_limit(&self) -> usize {
        self.inflight_limit
    }

    pub const fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// The inflight gate. One permit per task from admission to completion.
    pub fn gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate)
    }

    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.gate).try_acquire_owned().ok()
    }

    /// Asks the rate limiter for `batch` permits towards `destination`.
    pub fn reserve(&self, destination: IpAddr, batch: u32) -> Reservation {
        let reservation = self
            .limiter
            .as_ref()
            .map_or(Reservation::Granted, |limiter| limiter.reserve(destination, batch));
        if reservation.is_granted() {
            self.permits_granted
                .fetch_add(u64::from(batch), Ordering::Relaxed);
        }
        reservation
    }

    pub fn permits_granted(&self) -> u64 {
        self.permits_granted.load(Ordering::Relaxed)
    }

    /// Smoothed permits per second. Recomputed at most once a second.
    pub fn effective_pps(&self) -> f64 {
        let now = Instant::now();
        let total = self.permits_granted();
        let mut estimate = self.pps.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(last_at) = estimate.last_at else {
            estimate.last_at = Some(now);
            estimate.last_total = total;
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(last_at);
        if elapsed < PPS_SAMPLE_PERIOD {
            return estimate.smoothed;
        }

        let pps = total.saturating_sub(estimate.last_total) as f64 / elapsed.as_secs_f64();
        estimate.last_total = total;
        estimate.last_at = Some(now);
        estimate.smoothed = if estimate.smoothed == 0.0 {
            pps
        } else {
            PPS_SMOOTHING * pps + (1.0 - PPS_SMOOTHING) * estimate.smoothed
        };
        estimate.smoothed
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Starts the tuner for auto mode. Manual mode returns `None`.
    pub fn spawn_auto_tune(
        self: &Arc<Self>,
        pool: Arc<WorkerPool>,
        sampler: Box<dyn LoadSampler>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.mode != ConcurrencyMode::Auto {
            return None;
        }
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            manager.auto_tune(&pool, sampler, cancel).await;
        }))
    }

    async fn auto_tune(
        &self,
        pool: &WorkerPool,
        mut sampler: Box<dyn LoadSampler>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + TUNE_INTERVAL, TUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = self.stats.snapshot(&StatsSnapshot::default());

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let window = self.stats.snapshot(&last);
            last = window;
            let cpu = sampler.cpu_percent();
            let current = pool.capacity();
            let desired = tune_decision(current, &window, cpu, self.min_threads, self.max_threads);

            if desired == current {
                debug!(
                    "Pool steady at {current} (cpu {cpu:.1}%, backlog {}, ops {})",
                    window.backlog,
                    window.window_ops()
                );
                continue;
            }

            info!(
                "Resizing worker pool {} -> {} (cpu {:.1}%, errors {:.1}%, timeouts {:.1}%, backlog {}, rtt {:?})",
                current,
                desired,
                cpu,
                window.error_rate() * 100.0,
                window.timeout_rate() * 100.0,
                window.backlog,
                window.average_rtt()
            );
            pool.resize(desired);
        }
    }
}
