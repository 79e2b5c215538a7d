use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

/// Health bookkeeping for one (provider, upstream model) entry.
///
/// Counters are plain atomics: readers may observe slightly stale values, which
/// is fine because the healthy flag is a routing hint. The mutex exists only to
/// keep recovery probes single-flight per entry.
pub struct HealthState {
    healthy: AtomicBool,
    failures: AtomicU32,
    last_failure_unix: AtomicI64,
    last_probe_unix: AtomicI64,
    max_failures: u32,
    probe_gate: Mutex<()>,
}

impl HealthState {
    pub(crate) fn new(max_failures: u32) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            last_failure_unix: AtomicI64::new(0),
            last_probe_unix: AtomicI64::new(0),
            max_failures,
            probe_gate: Mutex::new(()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn last_failure_unix(&self) -> i64 {
        self.last_failure_unix.load(Ordering::Relaxed)
    }

    /// Resets the failure counter. Returns true when the entry transitioned
    /// from unhealthy back to healthy.
    pub(crate) fn record_success(&self) -> bool {
        self.failures.store(0, Ordering::Relaxed);
        !self.healthy.swap(true, Ordering::Relaxed)
    }

    /// Bumps the failure counter and trips the healthy flag once the threshold
    /// is reached. Returns the new count and whether this call tripped it.
    pub(crate) fn record_failure(&self) -> (u32, bool) {
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure_unix.store(unix_now(), Ordering::Relaxed);
        let mut tripped = false;
        if count >= self.max_failures {
            tripped = self.healthy.swap(false, Ordering::Relaxed);
        }
        (count, tripped)
    }

    pub(crate) fn mark_recovered(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
    }

    pub(crate) fn probe_gate(&self) -> &Mutex<()> {
        &self.probe_gate
    }

    /// Interval gate for recovery probes: stamps and admits the probe only when
    /// at least `min_interval_secs` have passed since the previous one.
    pub(crate) fn begin_probe(&self, min_interval_secs: i64) -> bool {
        let now = unix_now();
        if now - self.last_probe_unix.load(Ordering::Relaxed) < min_interval_secs {
            return false;
        }
        self.last_probe_unix.store(now, Ordering::Relaxed);
        true
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_exactly_at_threshold_and_recovers_on_success() {
        let health = HealthState::new(3);
        assert!(health.is_healthy());

        assert_eq!(health.record_failure(), (1, false));
        assert_eq!(health.record_failure(), (2, false));
        assert!(health.is_healthy());

        let (count, tripped) = health.record_failure();
        assert_eq!(count, 3);
        assert!(tripped);
        assert!(!health.is_healthy());

        // Further failures stay unhealthy without re-tripping.
        assert_eq!(health.record_failure(), (4, false));

        assert!(health.record_success());
        assert!(health.is_healthy());
        assert_eq!(health.failure_count(), 0);
        assert!(!health.record_success());
    }

    #[test]
    fn probe_gate_is_single_flight() {
        let health = HealthState::new(3);
        let held = health.probe_gate().try_lock().unwrap();
        assert!(health.probe_gate().try_lock().is_err());
        drop(held);
        assert!(health.probe_gate().try_lock().is_ok());
    }

    #[test]
    fn probe_interval_gate_admits_once_per_window() {
        let health = HealthState::new(3);
        assert!(health.begin_probe(3600));
        assert!(!health.begin_probe(3600));
        assert!(health.begin_probe(0));
    }
}
