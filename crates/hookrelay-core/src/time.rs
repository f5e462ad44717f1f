//! Clock abstraction for deterministic retry and probe timing.
//!
//! Backoff sleeps and health probe intervals go through a `Clock` so tests
//! can run whole retry schedules without waiting in real time.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Boxed future returned by [`Clock::sleep`].
pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of time for the dispatcher.
///
/// Production code uses `RealClock`. Tests inject `TestClock`, whose sleep
/// advances virtual time and returns immediately.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for latency measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Waits for the given duration.
    fn sleep(&self, duration: Duration) -> Sleep<'_>;
}

/// Clock backed by the system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for tests.
///
/// Clones share the same timeline. Every `sleep` is recorded so tests can
/// assert on the backoff schedule that was applied.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock starting at a fixed wall-clock time.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            sleeps: Arc::default(),
            base_instant: Instant::now(),
            base_utc: start,
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Durations passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed =
            chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.base_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        if let Ok(mut log) = self.sleeps.lock() {
            log.push(duration);
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_timelines() {
        let start =
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let clock = TestClock::starting_at(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(10));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_clock_sleep_is_virtual_and_recorded() {
        let clock = TestClock::new();
        let shared = clock.clone();

        shared.sleep(Duration::from_secs(5)).await;
        shared.sleep(Duration::from_secs(10)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(15));
        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(5), Duration::from_secs(10)]);
    }
}
