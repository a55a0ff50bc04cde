//! Lock-free execution counters feeding the auto-tuner.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic counters. Never reset: readers diff two [`StatsSnapshot`]s.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    duration_ns: AtomicU64,
    inflight: AtomicI64,
    backlog: AtomicI64,
}

/// Counter values at one instant, plus the deltas against the previous
/// snapshot handed to [`ExecutionStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub duration_ns: u64,
    pub inflight: i64,
    pub backlog: i64,

    pub delta_successes: u64,
    pub delta_failures: u64,
    pub delta_timeouts: u64,
    pub delta_duration_ns: u64,
}

impl StatsSnapshot {
    /// Operations finished inside the window.
    pub const fn window_ops(&self) -> u64 {
        self.delta_successes + self.delta_failures + self.delta_timeouts
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.delta_failures, self.window_ops())
    }

    pub fn timeout_rate(&self) -> f64 {
        ratio(self.delta_timeouts, self.window_ops())
    }

    /// Mean probe duration over the window, zero when nothing finished.
    pub fn average_rtt(&self) -> Duration {
        match self.window_ops() {
            0 => Duration::ZERO,
            ops => Duration::from_nanos(self.delta_duration_ns / ops),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl ExecutionStats {
    pub fn record_start(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one finished task as exactly one of success, timeout or failure.
    pub fn record_finish(&self, success: bool, timed_out: bool, duration: Duration) {
        let counter = if success {
            &self.successes
        } else if timed_out {
            &self.timeouts
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.duration_ns.fetch_add(nanos, Ordering::Relaxed);
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_backlog(&self, n: usize) {
        if n > 0 {
            self.backlog
                .fetch_add(i64::try_from(n).unwrap_or(i64::MAX), Ordering::Relaxed);
        }
    }

    /// Never lets the backlog drop below zero.
    pub fn remove_backlog(&self, n: usize) {
        if n == 0 {
            return;
        }
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let _ = self
            .backlog
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current - n).max(0))
            });
    }

    pub fn backlog(&self) -> i64 {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Reads every counter and diffs it against `previous`.
    pub fn snapshot(&self, previous: &StatsSnapshot) -> StatsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let duration_ns = self.duration_ns.load(Ordering::Relaxed);

        StatsSnapshot {
            successes,
            failures,
            timeouts,
            duration_ns,
            inflight: self.inflight.load(Ordering::Relaxed),
            backlog: self.backlog.load(Ordering::Relaxed),
            delta_successes: successes.saturating_sub(previous.successes),
            delta_failures: failures.saturating_sub(previous.failures),
            delta_timeouts: timeouts.saturating_sub(previous.timeouts),
            delta_duration_ns: duration_ns.saturating_sub(previous.duration_ns),
        }
    }
}
