//! Engine counters exposed to monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters, updated with relaxed ordering from the hot paths.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub items_submitted: AtomicU64,
    pub items_rejected: AtomicU64,
    pub items_completed: AtomicU64,
    pub items_failed: AtomicU64,
    pub items_cancelled: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub batches_settled: AtomicU64,
    pub inference_calls: AtomicU64,
    pub inference_time_us: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// JSON view for a monitoring endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "items": {
                "submitted": self.items_submitted.load(Ordering::Relaxed),
                "rejected": self.items_rejected.load(Ordering::Relaxed),
                "completed": self.items_completed.load(Ordering::Relaxed),
                "failed": self.items_failed.load(Ordering::Relaxed),
                "cancelled": self.items_cancelled.load(Ordering::Relaxed),
            },
            "batches": {
                "dispatched": self.batches_dispatched.load(Ordering::Relaxed),
                "settled": self.batches_settled.load(Ordering::Relaxed),
            },
            "inference": {
                "calls": self.inference_calls.load(Ordering::Relaxed),
                "total_time_us": self.inference_time_us.load(Ordering::Relaxed),
            },
            "retries_scheduled": self.retries_scheduled.load(Ordering::Relaxed),
            "notifications": {
                "sent": self.notifications_sent.load(Ordering::Relaxed),
                "failed": self.notifications_failed.load(Ordering::Relaxed),
            },
        })
    }
}
