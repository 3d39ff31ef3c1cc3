use crate::{SpineStats, monitoring::DispatchRecord};

/// Observer of a [`Spine`](crate::Spine)'s dispatch records.
///
/// Monitors are called inline from the dispatch loop, so they should be
/// quick and must not block.
pub trait Monitor: Send + Sync {
    fn on_record(&self, record: &DispatchRecord);

    /// Called once when [`Spine::run`](crate::Spine::run) returns, on success or failure.
    fn on_run_end(&self, _stats: &SpineStats) {}
}
