use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// Timing of the engine's process cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    pub cycles: u64,
    /// Cycles whose processing took longer than their period.
    pub overruns: u64,
    pub last_cycle_ns: u64,
    pub max_cycle_ns: u64,
}

#[derive(Clone)]
pub struct CycleMetricsCollector {
    inner: Arc<CycleMetricsInner>,
}

impl CycleMetricsCollector {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(CycleMetricsInner {
                cycles: AtomicU64::new(0),
                overruns: AtomicU64::new(0),
                last_cycle_ns: AtomicU64::new(0),
                max_cycle_ns: AtomicU64::new(0),
                history: MetricsRing::new(history_capacity),
            }),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> CycleMetrics {
        CycleMetrics {
            cycles: self.inner.cycles.load(Ordering::Relaxed),
            overruns: self.inner.overruns.load(Ordering::Relaxed),
            last_cycle_ns: self.inner.last_cycle_ns.load(Ordering::Relaxed),
            max_cycle_ns: self.inner.max_cycle_ns.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn record_cycle(&self, duration: Duration, period_ns: u64) {
        let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        let cycles = self.inner.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.last_cycle_ns.store(nanos, Ordering::Relaxed);
        let max_ns = self.inner.update_max(nanos);
        let overruns = if period_ns > 0 && nanos > period_ns {
            self.inner.overruns.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.inner.overruns.load(Ordering::Relaxed)
        };

        self.inner.history.push(CycleMetrics {
            cycles,
            overruns,
            last_cycle_ns: nanos,
            max_cycle_ns: max_ns.max(nanos),
        });
    }

    pub fn drain_history(&self) -> Vec<CycleMetrics> {
        let mut metrics = Vec::new();
        while let Some(entry) = self.inner.history.pop() {
            metrics.push(entry);
        }
        metrics
    }

    pub fn reset(&self) {
        self.inner.cycles.store(0, Ordering::Relaxed);
        self.inner.overruns.store(0, Ordering::Relaxed);
        self.inner.last_cycle_ns.store(0, Ordering::Relaxed);
        self.inner.max_cycle_ns.store(0, Ordering::Relaxed);
        self.inner.history.clear();
    }
}

struct CycleMetricsInner {
    cycles: AtomicU64,
    overruns: AtomicU64,
    last_cycle_ns: AtomicU64,
    max_cycle_ns: AtomicU64,
    history: MetricsRing,
}

impl CycleMetricsInner {
    #[inline]
    fn update_max(&self, candidate: u64) -> u64 {
        let mut current = self.max_cycle_ns.load(Ordering::Relaxed);
        while candidate > current {
            match self.max_cycle_ns.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(previous) => current = previous,
            }
        }
        current
    }
}

/// Bounded history of cycle snapshots. The oldest entry is evicted when the
/// process thread pushes into a full ring.
struct MetricsRing {
    queue: ArrayQueue<CycleMetrics>,
}

impl MetricsRing {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(16)),
        }
    }

    #[inline]
    fn push(&self, metrics: CycleMetrics) {
        if self.queue.push(metrics).is_err() {
            let _ = self.queue.pop();
            let _ = self.queue.push(metrics);
        }
    }

    #[inline]
    fn pop(&self) -> Option<CycleMetrics> {
        self.queue.pop()
    }

    fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Nominal duration of one cycle.
pub fn cycle_period_ns(sample_rate: u32, buffer_size: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    u64::from(buffer_size) * 1_000_000_000 / u64::from(sample_rate)
}
