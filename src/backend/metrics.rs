use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters of a [`StreamBackend`](crate::backend::StreamBackend).
#[derive(Debug, Default)]
pub struct BackendMetrics {
    pub(crate) enqueued: AtomicU64,
    pub(crate) pulled: AtomicU64,
    pub(crate) acked: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) reconnections: AtomicU64,
    pub(crate) pending_recovered: AtomicU64,
}

/// Point-in-time copy of [`BackendMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    /// Events handed out, including reclaimed ones.
    pub pulled: u64,
    pub acked: u64,
    /// Entries moved to the dead-letter stream.
    pub failed: u64,
    pub reconnections: u64,
    /// Pending entries reclaimed from idle consumers.
    pub pending_recovered: u64,
}

impl BackendMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            pending_recovered: self.pending_recovered.load(Ordering::Relaxed),
        }
    }
}
