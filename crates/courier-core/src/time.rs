//! Clock abstraction for deterministic timing in the delivery pipeline.
//!
//! Breaker cooldowns, retry backoff and idempotency windows are all
//! time-driven; injecting the clock lets tests drive those transitions
//! without real sleeps.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Time source injected into the delivery engine and circuit breaker.
///
/// Production code uses [`RealClock`]; tests use [`TestClock`] to advance
/// cooldowns and backoff windows instantly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    ///
    /// Maps to `tokio::time::sleep` in production; the test clock advances
    /// virtual time and yields instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a `chrono` timestamp.
    ///
    /// Queue columns (`next_retry_at`, `completed_at`, window cutoffs) are
    /// all `TIMESTAMPTZ`, so this is the form most callers want.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Monotonic and wall-clock components advance together but the wall clock
/// may also jump backwards, which the monotonic side never does. Cloned
/// handles share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Nanoseconds advanced since construction (monotonic)
    advanced_ns: Arc<AtomicU64>,
    /// Wall-clock time as nanoseconds since UNIX_EPOCH
    wall_ns: Arc<AtomicU64>,
    /// Anchor for monotonic readings
    origin: Instant,
}

impl TestClock {
    /// Creates a test clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock anchored at a specific wall-clock time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            advanced_ns: Arc::new(AtomicU64::new(0)),
            wall_ns: Arc::new(AtomicU64::new(saturating_ns(since_epoch))),
            origin: Instant::now(),
        }
    }

    /// Advances both clocks by `duration`.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_ns(duration);
        self.advanced_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Moves the wall clock to `time`.
    ///
    /// Forward jumps advance the monotonic clock too; backward jumps move
    /// only the wall clock.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns =
            saturating_ns(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.wall_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.wall_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Total virtual time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.advanced_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.advanced_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.wall_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Virtual sleep: advance time, then yield so other tasks can observe it.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_moves_monotonic_and_wall_clock_together() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(500));
        let before = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(10));
        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(510));
    }

    #[test]
    fn backward_jump_moves_only_wall_clock() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(2000));
        clock.advance(Duration::from_secs(5));
        let monotonic = clock.now();

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(1000));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(1000));
        assert_eq!(clock.now(), monotonic);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_secs(30));

        assert_eq!(other.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn now_utc_tracks_wall_clock() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(86_400));
        clock.advance(Duration::from_secs(60));

        assert_eq!(clock.now_utc().timestamp(), 86_460);
    }

    #[tokio::test]
    async fn virtual_sleep_advances_without_blocking() {
        let clock = TestClock::new();
        let before = clock.now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(3600));
    }
}
