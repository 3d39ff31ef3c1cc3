//! Event queues the [`Spine`](crate::Spine) pulls from and enqueues into.
//!
//! - [`MemoryBackend`] - in-process FIFO, lost on exit
//! - [`StreamBackend`] - durable, at-least-once delivery over a consumer-group
//!   stream ([`RedisStreams`] in production, [`MemoryStreams`] in tests)

mod client;
mod memory;
mod memory_streams;
mod metrics;
#[cfg(feature = "redis")]
mod redis;
mod stream;

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{Event, Result};

pub use client::{PendingEntry, StreamClient, StreamEntry, StreamStats};
pub use memory::MemoryBackend;
pub use memory_streams::MemoryStreams;
pub use metrics::{BackendMetrics, MetricsSnapshot};
#[cfg(feature = "redis")]
pub use redis::RedisStreams;
pub use stream::{StreamBackend, StreamConfig};

/// Result of a [`Backend::health`] probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub latency_ms: f64,
    pub details: serde_json::Value,
}

/// Storage the Spine reads events from and writes emitted events to.
///
/// Methods take `&self` so a backend can be shared (for example through an
/// `Arc`) between a running Spine and producers feeding it.
pub trait Backend: Send + Sync + 'static {
    /// Append an event to the queue.
    fn enqueue(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing
    /// arrived in time.
    fn pull(&self, timeout: Duration) -> impl Future<Output = Result<Option<Event>>> + Send;

    /// Confirm a pulled event was fully processed.
    fn ack(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Reject a pulled event as permanently failed.
    fn nack(&self, event: &Event, reason: &str) -> impl Future<Output = Result<()>> + Send;

    fn health(&self) -> impl Future<Output = Health> + Send;

    /// Whether events pulled but never acked are delivered again later.
    fn redelivers(&self) -> bool {
        false
    }

    /// Release connections. The backend must not be used afterwards.
    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

impl<B: Backend> Backend for Arc<B> {
    fn enqueue(&self, event: &Event) -> impl Future<Output = Result<()>> + Send {
        (**self).enqueue(event)
    }

    fn pull(&self, timeout: Duration) -> impl Future<Output = Result<Option<Event>>> + Send {
        (**self).pull(timeout)
    }

    fn ack(&self, event: &Event) -> impl Future<Output = Result<()>> + Send {
        (**self).ack(event)
    }

    fn nack(&self, event: &Event, reason: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).nack(event, reason)
    }

    fn health(&self) -> impl Future<Output = Health> + Send {
        (**self).health()
    }

    fn redelivers(&self) -> bool {
        (**self).redelivers()
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).close()
    }
}
