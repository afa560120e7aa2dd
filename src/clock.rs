use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source injected into every timed component.
///
/// All phase deadlines, cache TTLs and circuit-breaker recovery windows are
/// evaluated against this trait rather than `Instant::now()`, so that the
/// whole timeline can be driven deterministically in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now).await;
        }
    }
}

/// Wall-clock implementation backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests.
///
/// `now()` returns a fixed base instant plus an offset. Sleeping advances
/// the offset immediately (and yields once so concurrent tasks get a turn),
/// so timelines spanning minutes run in milliseconds. `advance` moves time
/// forward without a suspension point, for purely synchronous checks such
/// as TTL expiry or circuit-breaker recovery windows.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move virtual time forward
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap();
        self.base + *offset
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
