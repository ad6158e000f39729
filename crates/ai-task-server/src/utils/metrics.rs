use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    messages_acked: AtomicU64,
    messages_requeued: AtomicU64,
    messages_dead_lettered: AtomicU64,
    total_handler_time_ms: AtomicU64,
    messages_published: AtomicU64,
    completions_served: AtomicU64,
    completions_failed: AtomicU64,
}

/// Point-in-time copy of the counters, for the readiness endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_acked: u64,
    pub messages_requeued: u64,
    pub messages_dead_lettered: u64,
    pub total_handler_time_ms: u64,
    pub messages_published: u64,
    pub completions_served: u64,
    pub completions_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn increment_acked(&self) {
        self.inner.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_requeued(&self) {
        self.inner.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dead_lettered(&self) {
        self.inner.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_published(&self) {
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completions_served(&self) {
        self.inner.completions_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completions_failed(&self) {
        self.inner.completions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_handler_time(&self, duration: Duration) {
        self.inner
            .total_handler_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_acked: self.inner.messages_acked.load(Ordering::Relaxed),
            messages_requeued: self.inner.messages_requeued.load(Ordering::Relaxed),
            messages_dead_lettered: self.inner.messages_dead_lettered.load(Ordering::Relaxed),
            total_handler_time_ms: self.inner.total_handler_time_ms.load(Ordering::Relaxed),
            messages_published: self.inner.messages_published.load(Ordering::Relaxed),
            completions_served: self.inner.completions_served.load(Ordering::Relaxed),
            completions_failed: self.inner.completions_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer helper untuk measure duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
