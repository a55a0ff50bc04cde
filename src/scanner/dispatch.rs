//! Turns an [`Expansion`] into probe tasks and feeds them to the worker pool.
//!
//! Two long-lived tasks cooperate per run. The target stream walks one
//! cursor per address range round-robin, preflights each address on first
//! visit and emits port chunks into a bounded channel. The dispatch loop
//! owns every queue: it admits tasks through the inflight gate, the rate
//! limiter and the worker pool, in that order, and parks rate-limited tasks
//! until their tokens are due.
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::concurrency::{
    ConcurrencyManager, ConcurrencyOptions, ProcessCpu, WorkerPool, WorkerSlot, PORT_CHUNK_SIZE,
};
use super::preflight::{run_preflight, Dialer, PreflightConfig};
use super::progress::{classify_status, Progress, ProgressReporter, ProgressSink};
use super::rate_limit::Reservation;
use super::{Probe, ProbeOutcome, RunSummary, ScanResult, ScanTask};
use crate::address::{AddressIter, AddressRange, Expansion, HostMap};
use crate::error::ScanError;

/// Shortest delay before a rate-limited task is retried.
pub const RETRY_FLOOR: Duration = Duration::from_millis(50);
/// Upstream channel slots per worker the pool may grow to.
const QUEUE_PER_WORKER: usize = 4;
const YIELD_EVERY: u64 = 64;

/// Everything a run needs once its request has been validated.
#[derive(Debug)]
pub(crate) struct RunPlan {
    pub expansion: Expansion,
    pub ports: Arc<[u16]>,
    pub preflight: Option<PreflightConfig>,
    pub probe_timeout: Duration,
    pub concurrency: ConcurrencyOptions,
    pub worker: Option<Arc<str>>,
}

impl RunPlan {
    /// `addresses * ports`, saturating.
    pub fn planned(&self) -> u64 {
        let ports = u128::try_from(self.ports.len()).unwrap_or(u128::MAX);
        u64::try_from(self.expansion.address_count().saturating_mul(ports)).unwrap_or(u64::MAX)
    }
}

/// Runs `plan` to completion or cancellation.
pub(crate) async fn execute(
    plan: RunPlan,
    probe: Arc<dyn Probe>,
    dialer: Arc<dyn Dialer>,
    results: mpsc::Sender<ScanResult>,
    progress: mpsc::UnboundedSender<Progress>,
    cancel: CancellationToken,
) -> Result<RunSummary, ScanError> {
    let manager = Arc::new(ConcurrencyManager::new(&plan.concurrency, plan.probe_timeout));
    let planned = plan.planned();
    let reporter = ProgressReporter::spawn(planned, progress, Arc::<ConcurrencyManager>::clone(&manager));

    let pool = match WorkerPool::new(manager.initial_workers()) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            reporter.close().await;
            return Err(e);
        }
    };
    let tuner_stop = cancel.child_token();
    let tuner = manager.spawn_auto_tune(
        Arc::clone(&pool),
        Box::new(ProcessCpu::new()),
        tuner_stop.clone(),
    );

    let queue_cap = manager
        .max_threads()
        .saturating_mul(QUEUE_PER_WORKER)
        .max(PORT_CHUNK_SIZE);
    info!(
        "Dispatching {} probes over {} ranges ({} ports each, queue {})",
        planned,
        plan.expansion.ranges.len(),
        plan.ports.len(),
        queue_cap
    );

    let (upstream_tx, mut upstream) = mpsc::channel(queue_cap);
    let stream = TargetStream {
        expansion: plan.expansion,
        ports: plan.ports,
        preflight: plan.preflight,
        dialer,
        manager: Arc::clone(&manager),
        sink: reporter.sink(),
        cancel: cancel.clone(),
    };
    let producer = tokio::spawn(stream.run(upstream_tx));

    let mut dispatcher = Dispatcher {
        pool: Arc::clone(&pool),
        worker: Worker {
            probe,
            manager: Arc::clone(&manager),
            sink: reporter.sink(),
            results,
            cancel: cancel.clone(),
            label: plan.worker,
        },
        ready: VecDeque::new(),
        pending: VecDeque::new(),
        delayed: BinaryHeap::new(),
        queue_cap,
        seq: 0,
        steps: 0,
        submitted: 0,
        deferrals: 0,
    };
    let exit = dispatcher.run(&mut upstream, &cancel).await;
    let (submitted, deferrals) = (dispatcher.submitted, dispatcher.deferrals);
    // Releases the dispatcher's result sender and progress sink.
    drop(dispatcher);

    pool.drain().await;
    tuner_stop.cancel();
    if let Some(tuner) = tuner {
        if let Err(e) = tuner.await {
            warn!("Auto-tune loop ended abnormally: {e}");
        }
    }
    let streamed = producer.await;
    let last = reporter.close().await;
    let streamed = streamed?;

    let summary = RunSummary {
        planned,
        generated: streamed.generated,
        submitted,
        abandoned: streamed.unsent + exit.abandoned,
        preflight_rejected: streamed.rejected_tasks,
        unreachable_addresses: streamed.rejected_addresses,
        succeeded: last.succeeded,
        failed: last.failed,
        timed_out: last.timed_out,
        deferrals,
        final_capacity: pool.capacity(),
        elapsed_ms: u64::try_from(manager.uptime().as_millis()).unwrap_or(u64::MAX),
        cancelled: exit.cancelled,
    };
    info!(
        "Run {} after {}ms: {} submitted, {} open, {} abandoned, {} skipped by preflight, {} deferrals",
        if summary.cancelled { "cancelled" } else { "finished" },
        summary.elapsed_ms,
        summary.submitted,
        summary.succeeded,
        summary.abandoned,
        summary.preflight_rejected,
        summary.deferrals
    );
    Ok(summary)
}

/// Iteration state over one range: the current address, the next port
/// chunk and the address's preflight verdict.
#[derive(Debug)]
struct AddressCursor {
    range: AddressRange,
    addresses: AddressIter,
    current: Option<IpAddr>,
    hostnames: Arc<[String]>,
    next_port: usize,
    alive: Option<bool>,
}

impl AddressCursor {
    fn new(range: AddressRange, hosts: &HostMap) -> Self {
        let mut cursor = Self {
            range,
            addresses: range.iter(),
            current: None,
            hostnames: Vec::new().into(),
            next_port: 0,
            alive: None,
        };
        cursor.advance(hosts);
        cursor
    }

    /// Moves to the next address. `false` once the range is exhausted.
    fn advance(&mut self, hosts: &HostMap) -> bool {
        self.next_port = 0;
        self.alive = None;
        self.current = self.addresses.next();
        if let Some(addr) = self.current {
            self.hostnames = hosts.hosts_for(addr, self.range.base()).into();
        }
        self.current.is_some()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StreamReport {
    generated: u64,
    unsent: u64,
    rejected_tasks: u64,
    rejected_addresses: u64,
}

struct TargetStream {
    expansion: Expansion,
    ports: Arc<[u16]>,
    preflight: Option<PreflightConfig>,
    dialer: Arc<dyn Dialer>,
    manager: Arc<ConcurrencyManager>,
    sink: ProgressSink,
    cancel: CancellationToken,
}

impl TargetStream {
    async fn run(self, out: mpsc::Sender<ScanTask>) -> StreamReport {
        let mut report = StreamReport::default();
        if self.ports.is_empty() {
            return report;
        }

        let hosts = &self.expansion.hosts;
        let mut cursors: VecDeque<AddressCursor> = self
            .expansion
            .ranges
            .iter()
            .map(|range| AddressCursor::new(*range, hosts))
            .filter(|cursor| cursor.current.is_some())
            .collect();

        while let Some(mut cursor) = cursors.pop_front() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(addr) = cursor.current else {
                continue;
            };

            if let Some(preflight) = &self.preflight {
                let alive = match cursor.alive {
                    Some(alive) => alive,
                    None => {
                        let verdict =
                            run_preflight(addr, preflight, self.dialer.as_ref(), &self.cancel);
                        match verdict.await {
                            Ok(alive) => alive,
                            Err(_) => break,
                        }
                    }
                };
                cursor.alive = Some(alive);

                if !alive {
                    let n = self.ports.len();
                    self.sink.started(n).await;
                    self.sink.failed(n).await;
                    report.rejected_tasks += n as u64;
                    report.rejected_addresses += 1;
                    if cursor.advance(hosts) {
                        cursors.push_back(cursor);
                    }
                    continue;
                }
            }

            let start = cursor.next_port;
            let end = (start + PORT_CHUNK_SIZE).min(self.ports.len());
            let chunk = &self.ports[start..end];
            self.sink.enqueued(chunk.len()).await;
            self.manager.stats().add_backlog(chunk.len());
            report.generated += chunk.len() as u64;

            for (sent, &port) in chunk.iter().enumerate() {
                let task = ScanTask {
                    address: addr,
                    port,
                    hostnames: Arc::clone(&cursor.hostnames),
                };
                let delivered = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => false,
                    result = out.send(task) => result.is_ok(),
                };
                if !delivered {
                    let unsent = chunk.len() - sent;
                    self.manager.stats().remove_backlog(unsent);
                    report.unsent += unsent as u64;
                    debug!("Target stream stopped with {unsent} tasks of {addr} unsent");
                    return report;
                }
            }

            if end < self.ports.len() {
                cursor.next_port = end;
                cursors.push_back(cursor);
            } else if cursor.advance(hosts) {
                cursors.push_back(cursor);
            }
        }

        report
    }
}

/// A task parked until the rate limiter has tokens for it.
#[derive(Debug)]
struct DelayedTask {
    ready_at: Instant,
    seq: u64,
    task: ScanTask,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

/// The task the loop cannot move forward until a permit shows up.
enum Blocked {
    Gate(ScanTask),
    /// Admitted and paid for, waiting on a free worker.
    Slot(ScanTask, OwnedSemaphorePermit),
}

struct DispatchExit {
    abandoned: u64,
    cancelled: bool,
}

struct Dispatcher {
    pool: Arc<WorkerPool>,
    worker: Worker,
    ready: VecDeque<ScanTask>,
    pending: VecDeque<ScanTask>,
    delayed: BinaryHeap<Reverse<DelayedTask>>,
    queue_cap: usize,
    seq: u64,
    steps: u64,
    submitted: u64,
    deferrals: u64,
}

impl Dispatcher {
    fn queued(&self) -> usize {
        self.ready.len() + self.pending.len() + self.delayed.len()
    }

    fn promote(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(delayed)| delayed.ready_at <= now)
        {
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.pending.push_back(delayed.task);
            }
        }
    }

    fn defer(&mut self, task: ScanTask, wait: Duration) {
        self.seq += 1;
        self.deferrals += 1;
        self.delayed.push(Reverse(DelayedTask {
            ready_at: Instant::now() + wait.max(RETRY_FLOOR),
            seq: self.seq,
            task,
        }));
    }

    /// Gate, then rate limiter, then worker. A rate-limited task gives its
    /// gate permit back and is parked.
    fn submit(
        &mut self,
        task: ScanTask,
        admitted: Option<OwnedSemaphorePermit>,
    ) -> Option<Blocked> {
        let manager = &self.worker.manager;
        let Some(permit) = admitted.or_else(|| manager.try_admit()) else {
            return Some(Blocked::Gate(task));
        };

        if let Reservation::Wait(wait) = manager.reserve(task.address, 1) {
            drop(permit);
            self.defer(task, wait);
            return None;
        }

        match self.pool.try_slot() {
            Some(slot) => {
                self.launch(task, permit, slot);
                None
            }
            None => Some(Blocked::Slot(task, permit)),
        }
    }

    fn launch(&mut self, task: ScanTask, permit: OwnedSemaphorePermit, slot: WorkerSlot) {
        self.worker.manager.stats().remove_backlog(1);
        self.submitted += 1;
        let worker = self.worker.clone();
        self.pool.spawn(slot, worker.execute(task, permit));
    }

    async fn run(
        &mut self,
        upstream: &mut mpsc::Receiver<ScanTask>,
        cancel: &CancellationToken,
    ) -> DispatchExit {
        let gate = self.worker.manager.gate();
        let pool = Arc::clone(&self.pool);
        let mut blocked: Option<Blocked> = None;
        let mut upstream_open = true;

        let cancelled = loop {
            if cancel.is_cancelled() {
                break true;
            }
            self.promote(Instant::now());

            if blocked.is_none() {
                if let Some(task) = self.pending.pop_front().or_else(|| self.ready.pop_front()) {
                    blocked = self.submit(task, None);
                    self.steps += 1;
                    if self.steps % YIELD_EVERY == 0 {
                        tokio::task::yield_now().await;
                    }
                    if blocked.is_none() {
                        continue;
                    }
                } else if !upstream_open && self.delayed.is_empty() {
                    break false;
                }
            }

            let accept = upstream_open && self.queued() < self.queue_cap;
            let next_due = self.delayed.peek().map(|Reverse(delayed)| delayed.ready_at);
            let await_gate = matches!(blocked, Some(Blocked::Gate(_)));
            let await_slot = matches!(blocked, Some(Blocked::Slot(..)));

            tokio::select! {
                biased;
                () = cancel.cancelled() => break true,
                permit = Arc::clone(&gate).acquire_owned(), if await_gate => {
                    let Ok(permit) = permit else { break true };
                    if let Some(Blocked::Gate(task)) = blocked.take() {
                        blocked = self.submit(task, Some(permit));
                    }
                }
                slot = pool.slot(), if await_slot => {
                    let Some(slot) = slot else { break true };
                    if let Some(Blocked::Slot(task, permit)) = blocked.take() {
                        self.launch(task, permit, slot);
                    }
                }
                received = upstream.recv(), if accept => match received {
                    Some(task) => self.ready.push_back(task),
                    None => upstream_open = false,
                },
                () = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
            }
        };

        let mut abandoned = self.queued() as u64 + u64::from(blocked.is_some());
        self.ready.clear();
        self.pending.clear();
        self.delayed.clear();
        drop(blocked);

        upstream.close();
        while upstream.try_recv().is_ok() {
            abandoned += 1;
        }
        self.worker
            .manager
            .stats()
            .remove_backlog(usize::try_from(abandoned).unwrap_or(usize::MAX));
        if abandoned > 0 {
            info!("Abandoned {abandoned} queued tasks");
        }

        DispatchExit {
            abandoned,
            cancelled,
        }
    }
}

/// What every spawned task needs, cloned per task.
#[derive(Clone)]
struct Worker {
    probe: Arc<dyn Probe>,
    manager: Arc<ConcurrencyManager>,
    sink: ProgressSink,
    results: mpsc::Sender<ScanResult>,
    cancel: CancellationToken,
    label: Option<Arc<str>>,
}

impl Worker {
    /// Holds `_admitted` until the probe has finished and been reported.
    async fn execute(self, task: ScanTask, _admitted: OwnedSemaphorePermit) {
        let stats = self.manager.stats();
        self.sink.started(1).await;
        stats.record_start();

        let begin = Instant::now();
        // `probe` may panic before it hands back a future.
        let outcome = AssertUnwindSafe(async { self.probe.probe(&task).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!("Probe of {} panicked, counting it as failed", task.socket());
                ProbeOutcome::closed("probe panicked", begin.elapsed())
            });
        let duration = if outcome.duration.is_zero() {
            begin.elapsed()
        } else {
            outcome.duration
        };
        let timed_out = !outcome.open && classify_status(&outcome.status);
        stats.record_finish(outcome.open, timed_out, duration);

        if outcome.open {
            self.sink.succeeded(1).await;
            let result = ScanResult::new(&task, &outcome, duration, self.label.as_deref());
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {}
                sent = self.results.send(result) => {
                    if sent.is_err() {
                        debug!("Result for {} dropped, nobody is listening", task.socket());
                    }
                }
            }
        } else if timed_out {
            self.sink.timed_out(1).await;
        } else {
            self.sink.failed(1).await;
        }
    }
}
