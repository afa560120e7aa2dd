use crate::clock::Clock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Consecutive failures that open a circuit
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long an open circuit bypasses the primary path
pub const RECOVERY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct BreakerEntry {
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set when the recovery window elapsed and one primary retry was
    /// granted; a failure in this state re-opens the circuit immediately.
    half_open: bool,
}

/// Point-in-time view of one device's breaker, for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub is_open: bool,
    /// Seconds since the most recent failure
    pub last_failure_age_secs: Option<u64>,
}

/// Per-device failure gate with timed self-recovery.
///
/// Probe-after-cooldown policy: after the threshold is hit the primary
/// path is bypassed for the recovery window, then exactly one retry is
/// allowed. A failed retry re-opens the circuit; any success closes it
/// and clears the count. State lives for the process lifetime and is
/// mutated only by the orchestrator at phase-completion boundaries.
pub struct CircuitBreaker {
    clock: Arc<dyn Clock>,
    threshold: u32,
    recovery_window: Duration,
    entries: RwLock<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(clock, FAILURE_THRESHOLD, RECOVERY_WINDOW)
    }

    pub fn with_policy(clock: Arc<dyn Clock>, threshold: u32, recovery_window: Duration) -> Self {
        Self {
            clock,
            threshold,
            recovery_window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, name: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(name.to_string()).or_default();
        if entry.half_open {
            // The granted retry failed: straight back to open.
            entry.failure_count = self.threshold;
            entry.half_open = false;
        } else {
            entry.failure_count += 1;
        }
        entry.last_failure = Some(self.clock.now());
        tracing::warn!(
            "Recorded failure for device {} (count: {})",
            name,
            entry.failure_count
        );
    }

    pub fn record_success(&self, name: &str) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(name.to_string()).or_default();
        entry.failure_count = 0;
        entry.last_failure = None;
        entry.half_open = false;
        tracing::debug!("Recorded success for device {}", name);
    }

    /// Whether the primary path should be skipped for this device.
    ///
    /// Crossing the recovery window self-heals the circuit: the count is
    /// reset and this evaluation returns false, granting one retry.
    pub fn should_bypass_primary(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        if entry.failure_count < self.threshold {
            return false;
        }
        match entry.last_failure {
            Some(at) if self.clock.now().duration_since(at) <= self.recovery_window => true,
            _ => {
                tracing::info!("Circuit for {} healed after cooldown, allowing retry", name);
                entry.failure_count = 0;
                entry.half_open = true;
                false
            }
        }
    }

    /// Close the circuit and clear its history
    pub fn reset(&self, name: &str) {
        self.record_success(name);
    }

    pub fn snapshot(&self, name: &str) -> BreakerSnapshot {
        let entries = self.entries.read().unwrap();
        let Some(entry) = entries.get(name) else {
            return BreakerSnapshot {
                failure_count: 0,
                is_open: false,
                last_failure_age_secs: None,
            };
        };
        let now = self.clock.now();
        let age = entry.last_failure.map(|at| now.duration_since(at));
        let is_open = entry.failure_count >= self.threshold
            && age.is_some_and(|a| a <= self.recovery_window);
        BreakerSnapshot {
            failure_count: entry.failure_count,
            is_open,
            last_failure_age_secs: age.map(|a| a.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(clock.clone());
        (clock, breaker)
    }

    #[test]
    fn opens_after_exactly_three_failures() {
        let (_clock, breaker) = breaker();
        breaker.record_failure("Kitchen");
        breaker.record_failure("Kitchen");
        assert!(!breaker.should_bypass_primary("Kitchen"));
        breaker.record_failure("Kitchen");
        assert!(breaker.should_bypass_primary("Kitchen"));
    }

    #[test]
    fn success_resets_count_and_closes() {
        let (_clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure("Kitchen");
        }
        assert!(breaker.should_bypass_primary("Kitchen"));

        breaker.record_success("Kitchen");
        assert!(!breaker.should_bypass_primary("Kitchen"));
        assert_eq!(breaker.snapshot("Kitchen").failure_count, 0);
    }

    #[test]
    fn heals_after_recovery_window_and_reopens_on_next_failure() {
        let (clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure("Kitchen");
        }
        assert!(breaker.should_bypass_primary("Kitchen"));

        clock.advance(RECOVERY_WINDOW + Duration::from_secs(1));
        // First check after the window: closed, count cleared.
        assert!(!breaker.should_bypass_primary("Kitchen"));
        assert_eq!(breaker.snapshot("Kitchen").failure_count, 0);

        // The granted retry failed: circuit re-opens at once.
        breaker.record_failure("Kitchen");
        assert!(breaker.should_bypass_primary("Kitchen"));
    }

    #[test]
    fn devices_are_tracked_independently() {
        let (_clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure("Kitchen");
        }
        assert!(breaker.should_bypass_primary("Kitchen"));
        assert!(!breaker.should_bypass_primary("Bedroom"));
    }

    #[test]
    fn unknown_device_is_closed() {
        let (_clock, breaker) = breaker();
        assert!(!breaker.should_bypass_primary("Ghost"));
        let snap = breaker.snapshot("Ghost");
        assert!(!snap.is_open);
        assert_eq!(snap.failure_count, 0);
    }
}
