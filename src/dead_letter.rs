use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Event, Result};

/// An event that failed permanently, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: Event,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: Event, reason: impl Into<String>) -> Self {
        Self {
            event,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Append-only sink for [`DeadLetter`] records.
///
/// Implementations must tolerate concurrent readers; writers only ever append.
pub trait DeadLetterStore: Send + Sync + 'static {
    fn store(&self, record: DeadLetter) -> impl Future<Output = Result<()>> + Send;
}

impl<S: DeadLetterStore> DeadLetterStore for Arc<S> {
    fn store(&self, record: DeadLetter) -> impl Future<Output = Result<()>> + Send {
        (**self).store(record)
    }
}

/// In-process dead-letter store.
///
/// Clones share the same records, so keep a clone to inspect what a
/// [`Spine`](crate::Spine) stored. When bounded, the oldest records are
/// dropped first and counted.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetters {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    records: VecDeque<DeadLetter>,
    max_size: usize,
    dropped: u64,
}

impl MemoryDeadLetters {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `max_size` records (0 = unbounded).
    pub fn bounded(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_size,
                ..Inner::default()
            })),
        }
    }

    /// Snapshot of the stored records, oldest first.
    pub fn records(&self) -> Vec<DeadLetter> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Records evicted because the store was full.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn clear(&self) {
        self.lock().records.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadLetterStore for MemoryDeadLetters {
    fn store(&self, record: DeadLetter) -> impl Future<Output = Result<()>> + Send {
        let mut inner = self.lock();
        if inner.max_size > 0 && inner.records.len() >= inner.max_size {
            inner.records.pop_front();
            inner.dropped += 1;
        }
        inner.records.push_back(record);
        std::future::ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn letter(t: &str) -> DeadLetter {
        DeadLetter::new(Event::new(t, Value::Null).unwrap(), format!("{t} failed"))
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let store = MemoryDeadLetters::new();
        for i in 0..3 {
            store.store(letter(&format!("FAIL_{i}"))).await.unwrap();
        }
        let types: Vec<_> = store
            .records()
            .iter()
            .map(|r| r.event.event_type().to_owned())
            .collect();
        assert_eq!(types, ["FAIL_0", "FAIL_1", "FAIL_2"]);
        assert_eq!(store.records()[1].reason, "FAIL_1 failed");
    }

    #[tokio::test]
    async fn test_bounded_drops_oldest() {
        let store = MemoryDeadLetters::bounded(3);
        for i in 0..5 {
            store.store(letter(&format!("E{i}"))).await.unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.dropped_count(), 2);
        let types: Vec<_> = store
            .records()
            .iter()
            .map(|r| r.event.event_type().to_owned())
            .collect();
        assert_eq!(types, ["E2", "E3", "E4"]);
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = MemoryDeadLetters::new();
        let view = store.clone();
        store.store(letter("A")).await.unwrap();
        assert_eq!(view.len(), 1);
        view.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_dead_letter_serializes_event_inline() {
        let record = letter("A");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"]["event_type"], "A");
        let back: DeadLetter = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
