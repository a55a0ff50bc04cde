//! Coalesces task lifecycle events into periodic [`Progress`] snapshots.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How often a dirty snapshot is published.
pub const PROGRESS_TICK: Duration = Duration::from_millis(200);
const EVENT_BUFFER: usize = 128;

/// A point-in-time rollup of a run. Every counter only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub planned: u64,
    pub enqueued: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// `started - succeeded - failed - timed_out`, never negative.
    pub active: u64,
    pub pps: f64,
    pub uptime_ms: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Progress {
    /// Tasks that reached a terminal state.
    pub const fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Enqueued(n) => self.enqueued += n,
            Event::Started(n) => self.started += n,
            Event::Succeeded(n) => self.succeeded += n,
            Event::Failed(n) => self.failed += n,
            Event::TimedOut(n) => self.timed_out += n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Enqueued(u64),
    Started(u64),
    Succeeded(u64),
    Failed(u64),
    TimedOut(u64),
}

/// Rate and uptime figures stamped onto each snapshot.
pub trait Throughput: Send + Sync {
    fn effective_pps(&self) -> f64;
    fn uptime(&self) -> Duration;
}

impl Throughput for super::concurrency::ConcurrencyManager {
    fn effective_pps(&self) -> f64 {
        Self::effective_pps(self)
    }

    fn uptime(&self) -> Duration {
        Self::uptime(self)
    }
}

/// Cheap handle used by producers and workers to report lifecycle events.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    events: mpsc::Sender<Event>,
}

impl ProgressSink {
    async fn send(&self, event: Event) {
        // The reporter outlives every sink, so a closed channel only happens
        // during teardown.
        let _ = self.events.send(event).await;
    }

    pub async fn enqueued(&self, n: usize) {
        self.send(Event::Enqueued(count(n))).await;
    }

    pub async fn started(&self, n: usize) {
        self.send(Event::Started(count(n))).await;
    }

    pub async fn succeeded(&self, n: usize) {
        self.send(Event::Succeeded(count(n))).await;
    }

    pub async fn failed(&self, n: usize) {
        self.send(Event::Failed(count(n))).await;
    }

    pub async fn timed_out(&self, n: usize) {
        self.send(Event::TimedOut(count(n))).await;
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Single-writer aggregation loop.
///
/// Snapshots go out on the tick only when something changed since the last
/// one. [`ProgressReporter::close`] flushes whatever is left, so every event
/// sent before it is reflected downstream.
pub struct ProgressReporter {
    sink: ProgressSink,
    handle: JoinHandle<Progress>,
}

impl ProgressReporter {
    pub fn spawn(
        planned: u64,
        out: mpsc::UnboundedSender<Progress>,
        throughput: Arc<dyn Throughput>,
    ) -> Self {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(report(planned, rx, out, throughput));
        Self {
            sink: ProgressSink { events },
            handle,
        }
    }

    pub fn sink(&self) -> ProgressSink {
        self.sink.clone()
    }

    /// Stops accepting events and returns the final snapshot. Waits for
    /// every outstanding [`ProgressSink`] to be dropped.
    pub async fn close(self) -> Progress {
        drop(self.sink);
        self.handle.await.unwrap_or_default()
    }
}

async fn report(
    planned: u64,
    mut events: mpsc::Receiver<Event>,
    out: mpsc::UnboundedSender<Progress>,
    throughput: Arc<dyn Throughput>,
) -> Progress {
    let mut snapshot = Progress {
        planned,
        ..Progress::default()
    };
    let mut dirty = false;
    let mut ticker = interval(PROGRESS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let publish = |snapshot: &mut Progress| {
        snapshot.active = snapshot.started.saturating_sub(snapshot.finished());
        snapshot.pps = throughput.effective_pps();
        snapshot.uptime_ms = u64::try_from(throughput.uptime().as_millis()).unwrap_or(u64::MAX);
        snapshot.timestamp = Some(Utc::now());
        // Nobody listening is fine: the final snapshot is also returned.
        let _ = out.send(snapshot.clone());
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    snapshot.apply(event);
                    dirty = true;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if dirty {
                    publish(&mut snapshot);
                    dirty = false;
                }
            }
        }
    }

    publish(&mut snapshot);
    snapshot
}

/// `true` when a probe status reads like a timeout.
pub fn classify_status(status: &str) -> bool {
    let status = status.to_lowercase();
    status.contains("timeout") || status.contains("timed out")
}
