//! Token buckets for the global and per-destination permit rates.
//!
//! Buckets never sleep and never run a background timer. Each call refills
//! from the time elapsed since the previous call and either pays immediately
//! or reports how long the caller should wait before trying again.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
    /// Largest batch waiting on this bucket. The level may fill up to it
    /// when it exceeds `capacity`, so oversized batches are paid in full.
    held: f64,
}

impl BucketState {
    fn can_pay(&self, n: u32) -> bool {
        self.tokens >= f64::from(n)
    }

    fn pay(&mut self, n: u32) {
        let n = f64::from(n);
        self.tokens = (self.tokens - n).max(0.0);
        if n >= self.held {
            self.held = 0.0;
        }
    }
}

/// A single token bucket. The level stays within `[0, capacity]`, or
/// `[0, n]` while a batch of `n > capacity` is waiting for its tokens.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Returns `None` for a zero rate. A zero capacity falls back to the
    /// rate. The bucket starts empty.
    pub fn new(rate: u32, capacity: u32) -> Option<Self> {
        if rate == 0 {
            return None;
        }
        let capacity = if capacity == 0 { rate } else { capacity };

        Some(Self {
            rate: f64::from(rate),
            capacity: f64::from(capacity),
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last: Instant::now(),
                held: 0.0,
            }),
        })
    }

    /// A bucket sized the way the limiter sizes its buckets: a quarter of a
    /// second of burst, at least one token.
    pub fn for_rate(rate: u32) -> Option<Self> {
        Self::new(rate, rate / 4)
    }

    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// Current level after a refill at `now`.
    pub fn level(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Takes `n` tokens if available and returns zero, otherwise returns how
    /// long until the deficit would be covered. Takes nothing on a miss.
    ///
    /// Batches larger than the capacity are never discounted: they wait
    /// until all `n` tokens have accrued.
    pub fn wait(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if state.can_pay(n) {
            state.pay(n);
            Duration::ZERO
        } else {
            self.hold(&mut state, n);
            self.deficit(&state, n)
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // `last` moves to `now` on every observation, granted or not, so a long
    // idle stretch can never be counted twice.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        if elapsed > 0.0 {
            let ceiling = self.capacity.max(state.held);
            state.tokens = ceiling.min(state.tokens + self.rate * elapsed);
        }
        state.last = now;
    }

    fn deficit(&self, state: &BucketState, n: u32) -> Duration {
        Duration::from_secs_f64(((f64::from(n) - state.tokens) / self.rate).max(0.0))
    }

    fn hold(&self, state: &mut BucketState, n: u32) {
        let n = f64::from(n);
        if n > self.capacity {
            state.held = state.held.max(n);
        }
    }

}

/// Outcome of [`RateLimiter::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    /// Nothing was taken. Retry after at least this long.
    Wait(Duration),
}

impl Reservation {
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// One optional global bucket plus lazily created per-destination buckets.
#[derive(Debug)]
pub struct RateLimiter {
    global: Option<TokenBucket>,
    per_destination_rate: u32,
    per_destination: Mutex<HashMap<IpAddr, Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// `0` disables the corresponding limit. Returns `None` when both are off.
    pub fn new(global_pps: u32, per_destination_pps: u32) -> Option<Self> {
        if global_pps == 0 && per_destination_pps == 0 {
            return None;
        }
        Some(Self {
            global: TokenBucket::for_rate(global_pps),
            per_destination_rate: per_destination_pps,
            per_destination: Mutex::new(HashMap::new()),
        })
    }

    pub fn global(&self) -> Option<&TokenBucket> {
        self.global.as_ref()
    }

    fn destination_bucket(&self, destination: IpAddr) -> Option<Arc<TokenBucket>> {
        if self.per_destination_rate == 0 {
            return None;
        }
        let mut buckets = self
            .per_destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(&destination) {
            return Some(Arc::clone(bucket));
        }
        let bucket = Arc::new(TokenBucket::for_rate(self.per_destination_rate)?);
        buckets.insert(destination, Arc::clone(&bucket));
        Some(bucket)
    }

    /// Number of destinations that have been seen so far.
    pub fn tracked_destinations(&self) -> usize {
        self.per_destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Reserves `batch` permits for `destination` from both buckets, or from
    /// neither. On a miss the wait is the longest of the two deficits.
    pub fn reserve(&self, destination: IpAddr, batch: u32) -> Reservation {
        if batch == 0 {
            return Reservation::Granted;
        }
        let now = Instant::now();
        let destination = self.destination_bucket(destination);

        // Lock order is always global before destination.
        let mut global = self.global.as_ref().map(|bucket| (bucket, bucket.lock()));
        let mut local = destination
            .as_deref()
            .map(|bucket| (bucket, bucket.lock()));

        let mut wait = Duration::ZERO;
        for (bucket, state) in global.iter_mut().chain(local.iter_mut()) {
            bucket.refill(state, now);
            if !state.can_pay(batch) {
                bucket.hold(state, batch);
                wait = wait.max(bucket.deficit(state, batch));
            }
        }

        if wait > Duration::ZERO {
            return Reservation::Wait(wait);
        }

        for (_, state) in global.iter_mut().chain(local.iter_mut()) {
            state.pay(batch);
        }
        Reservation::Granted
    }
}

#[cfg(test)]
mod tests {
    use super::{RateLimiter, Reservation, TokenBucket};
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::time::advance;

    const DEST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 1));

    #[test]
    fn zero_rate_builds_nothing() {
        assert!(TokenBucket::new(0, 10).is_none());
        assert!(RateLimiter::new(0, 0).is_none());
        assert_eq!(TokenBucket::new(8, 0).unwrap().capacity(), 8.0);
        assert_eq!(TokenBucket::for_rate(3).unwrap().capacity(), 3.0);
        assert_eq!(TokenBucket::for_rate(200).unwrap().capacity(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_starts_empty_and_refills() {
        let bucket = TokenBucket::new(10, 5).unwrap();

        assert_eq!(bucket.wait(1), Duration::from_millis(100));
        advance(Duration::from_millis(100)).await;
        assert_eq!(bucket.wait(1), Duration::ZERO);

        advance(Duration::from_secs(10)).await;
        assert!((bucket.level() - 5.0).abs() < f64::EPSILON);
        assert_eq!(bucket.wait(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_miss_takes_nothing_and_pegs_time() {
        let bucket = TokenBucket::new(4, 4).unwrap();
        advance(Duration::from_millis(250)).await;

        assert_eq!(bucket.wait(2), Duration::from_millis(250));
        assert!((bucket.level() - 1.0).abs() < 1e-9);

        advance(Duration::from_millis(250)).await;
        assert_eq!(bucket.wait(2), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_never_exceed_rate_times_time_plus_burst() {
        let limiter = RateLimiter::new(20, 0).unwrap();
        let burst = limiter.global().unwrap().capacity();
        let mut granted = 0u32;

        for _ in 0..1000 {
            if limiter.reserve(DEST, 1).is_granted() {
                granted += 1;
            }
            advance(Duration::from_millis(5)).await;
        }

        let allowed = 20.0 * 5.0 + burst;
        assert!(f64::from(granted) <= allowed, "{granted} > {allowed}");
        assert!(granted >= 90);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_is_all_or_nothing() {
        let limiter = RateLimiter::new(100, 4).unwrap();
        advance(Duration::from_secs(1)).await;

        // Destination bucket starts empty, so the global bucket must not pay.
        let before = limiter.global().unwrap().level();
        let miss = limiter.reserve(DEST, 1);
        assert_eq!(miss, Reservation::Wait(Duration::from_millis(250)));
        assert!((limiter.global().unwrap().level() - before).abs() < 1e-9);

        advance(Duration::from_millis(250)).await;
        assert!(limiter.reserve(DEST, 1).is_granted());
        assert!(limiter.global().unwrap().level() < 25.0);
        assert_eq!(limiter.tracked_destinations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_destination_buckets_are_independent() {
        let limiter = RateLimiter::new(0, 4).unwrap();
        let other: IpAddr = "203.0.113.2".parse().unwrap();
        advance(Duration::from_secs(1)).await;

        // Each destination is created on first sight, empty.
        assert!(!limiter.reserve(DEST, 1).is_granted());
        advance(Duration::from_millis(250)).await;
        assert!(limiter.reserve(DEST, 1).is_granted());
        assert!(!limiter.reserve(other, 1).is_granted());
        assert_eq!(limiter.tracked_destinations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batch_waits_for_every_token() {
        let bucket = TokenBucket::new(4, 1).unwrap();

        assert_eq!(bucket.wait(8), Duration::from_secs(2));
        advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.wait(8), Duration::from_secs(1));
        // The waiting batch lets the level rise past the capacity.
        assert!((bucket.level() - 4.0).abs() < 1e-9);

        advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.wait(8), Duration::ZERO);
        assert!(bucket.level().abs() < 1e-9);

        // Once paid, the ceiling is back to the capacity.
        advance(Duration::from_secs(5)).await;
        assert!((bucket.level() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batches_stay_within_rate() {
        let limiter = RateLimiter::new(4, 0).unwrap();
        let burst = limiter.global().unwrap().capacity();
        let mut granted = 0u32;

        for _ in 0..40 {
            if limiter.reserve(DEST, 8).is_granted() {
                granted += 8;
            }
            advance(Duration::from_millis(250)).await;
        }

        let allowed = 4.0 * 10.0 + burst;
        assert!(f64::from(granted) <= allowed, "{granted} > {allowed}");
        assert_eq!(granted, 32);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batch_pays_both_buckets_in_full() {
        let limiter = RateLimiter::new(100, 4).unwrap();
        advance(Duration::from_secs(1)).await;

        // Destination capacity is 1, so 8 permits need two seconds of refill.
        assert_eq!(limiter.reserve(DEST, 8), Reservation::Wait(Duration::from_secs(2)));
        advance(Duration::from_secs(2)).await;
        let before = limiter.global().unwrap().level();
        assert!(limiter.reserve(DEST, 8).is_granted());
        assert!((before - limiter.global().unwrap().level() - 8.0).abs() < 1e-9);
    }
}
