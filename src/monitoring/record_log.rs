use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::monitoring::{DispatchRecord, Monitor, Stage};

/// Monitor keeping every record in memory.
///
/// Clones share the same log: register one clone with the Spine and query
/// the other.
#[derive(Debug, Clone, Default)]
pub struct RecordLog {
    records: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.lock().clone()
    }

    pub fn stage(&self, stage: Stage) -> Vec<DispatchRecord> {
        self.lock()
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.lock().iter().filter(|r| r.stage == stage).count()
    }

    /// Records of one event, in emission order.
    pub fn event(&self, event_id: Uuid) -> Vec<DispatchRecord> {
        self.lock()
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Handler names in the order they were dispatched to.
    pub fn dispatch_order(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.stage == Stage::Dispatched)
            .filter_map(|r| r.handler.as_deref().map(str::to_owned))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DispatchRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Monitor for RecordLog {
    fn on_record(&self, record: &DispatchRecord) {
        self.lock().push(record.clone());
    }
}
