use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

/// Counters describing a [`Spine`](crate::Spine) run.
///
/// Returned by [`Spine::run`](crate::Spine::run) and readable mid-run
/// through [`SpineHandle::stats`](crate::SpineHandle::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpineStats {
    /// Loop iterations started, including the one that tripped a limit.
    pub steps: u64,
    /// Events pulled and routed.
    pub events_processed: u64,
    /// Handler invocations.
    pub dispatches: u64,
    /// Emitted events successfully enqueued.
    pub events_emitted: u64,
    /// Failed enqueues per event type.
    pub enqueue_failures: HashMap<String, u64>,
    /// Failed invocations per handler name.
    pub handler_errors: HashMap<String, u64>,
    /// Records written to the dead-letter store.
    pub dead_lettered: u64,
    pub backend_errors: u64,
    pub ack_errors: u64,
}

impl SpineStats {
    /// Enqueue failures for one event type, or in total when `event_type` is `None`.
    pub fn enqueue_failure_count(&self, event_type: Option<&str>) -> u64 {
        match event_type {
            Some(t) => self.enqueue_failures.get(t).copied().unwrap_or(0),
            None => self.enqueue_failures.values().sum(),
        }
    }

    pub fn handler_error_count(&self, handler: &str) -> u64 {
        self.handler_errors.get(handler).copied().unwrap_or(0)
    }
}

/// Stats shared between a running Spine and its handles.
#[derive(Debug, Default)]
pub(crate) struct SharedStats(Mutex<SpineStats>);

impl SharedStats {
    pub fn update(&self, f: impl FnOnce(&mut SpineStats)) {
        f(&mut self.lock());
    }

    pub fn snapshot(&self) -> SpineStats {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = SpineStats::default();
    }

    fn lock(&self) -> MutexGuard<'_, SpineStats> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
