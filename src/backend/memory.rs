use std::{
    collections::VecDeque,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde_json::json;
use tokio::sync::Notify;

use crate::{
    Error, Event, Result,
    backend::{Backend, Health},
};

/// In-process FIFO queue.
///
/// Nothing survives the process, and `ack`/`nack` are no-ops: a pulled event
/// is gone from the queue.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding at most `capacity` events (0 = unbounded). Enqueueing
    /// into a full queue fails with [`Error::QueueFull`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_push(&self, event: &Event) -> Result<()> {
        let mut queue = self.lock();
        if self.capacity > 0 && queue.len() >= self.capacity {
            return Err(Error::QueueFull(self.capacity));
        }
        queue.push_back(event.clone());
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn enqueue(&self, event: &Event) -> impl Future<Output = Result<()>> + Send {
        let result = self.try_push(event);
        if result.is_ok() {
            self.notify.notify_one();
        }
        std::future::ready(result)
    }

    async fn pull(&self, timeout: Duration) -> Result<Option<Event>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let next = self.lock().pop_front();
            if next.is_some() {
                return Ok(next);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.lock().pop_front());
            }
        }
    }

    async fn ack(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _event: &Event, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        let start = Instant::now();
        let depth = self.len();
        Health {
            healthy: true,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            details: json!({ "backend": "memory", "queue_depth": depth, "capacity": self.capacity }),
        }
    }
}
