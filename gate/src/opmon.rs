//! Operation latency monitoring
//!
//! An [`Operation`] is started before a unit of work and finished with a
//! warning threshold. Going over the threshold is reported, never treated as
//! a failure. [`OperationStats`] aggregates finished operations for the
//! gate's stats snapshot.

use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A running timed operation
pub struct Operation {
    name: &'static str,
    started: Instant,
}

impl Operation {
    /// Starts timing; `name` shows up in the slow-operation warning
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }

    /// Ends the operation, warning if it ran longer than `warn_threshold`
    pub fn finish(self, warn_threshold: Duration) -> Duration {
        let elapsed = self.started.elapsed();
        if elapsed > warn_threshold {
            warn!(
                "opmon: operation {} took {:?} (threshold {:?})",
                self.name, elapsed, warn_threshold
            );
        }
        elapsed
    }
}

/// Lock-free counters over finished operations
#[derive(Debug, Default)]
pub struct OperationStats {
    count: AtomicU64,
    slow: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationSummary {
    pub count: u64,
    pub slow: u64,
    pub total: Duration,
    pub max: Duration,
}

impl OperationSummary {
    /// Mean duration of the recorded operations, zero if there were none
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(nanos as u64)
    }
}

impl OperationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one finished operation, counting it as slow above `threshold`
    pub fn record(&self, elapsed: Duration, threshold: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        if elapsed > threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of the counters
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            count: self.count.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
        }
    }
}
