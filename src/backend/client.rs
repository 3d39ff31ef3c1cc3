use std::{collections::HashMap, future::Future, time::Duration};

use crate::Result;

/// One entry of an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// An entry delivered to a consumer of a group but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    /// How many times the entry has been delivered.
    pub deliveries: u64,
}

/// Size and backlog of a stream as seen by one consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub length: u64,
    pub pending: u64,
    /// Entries not yet delivered to the group, when the server reports it.
    pub lag: Option<u64>,
}

/// Transport for consumer-group streams.
///
/// The commands mirror Redis Streams. Connection-level failures must be
/// reported as [`Error::Transport`](crate::Error::Transport) so callers can
/// reconnect and retry.
pub trait StreamClient: Send + Sync + 'static {
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drop and re-establish connections.
    fn reconnect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Create `group` on `stream` reading from the start, creating the
    /// stream if needed. Succeeds when the group already exists.
    fn create_group(&self, stream: &str, group: &str) -> impl Future<Output = Result<()>> + Send;

    /// Append an entry, returning its id.
    fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> impl Future<Output = Result<String>> + Send;

    /// Deliver the next never-delivered entry to `consumer`, waiting up to
    /// `block` (zero means do not wait).
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> impl Future<Output = Result<Option<StreamEntry>>> + Send;

    /// Oldest pending entries of the group, at most `count`.
    fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<PendingEntry>>> + Send;

    /// Transfer a pending entry idle for at least `min_idle` to `consumer`,
    /// incrementing its delivery count. `None` when the entry is gone or
    /// was claimed by someone else in the meantime.
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> impl Future<Output = Result<Option<StreamEntry>>> + Send;

    /// Entries with ids in `start..=end` (`-` and `+` for the open ends).
    fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<StreamEntry>>> + Send;

    fn ack(&self, stream: &str, group: &str, id: &str) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self, stream: &str, group: &str) -> impl Future<Output = Result<StreamStats>> + Send;

    /// Release the connections. Later commands fail with a non-transport
    /// error, so callers do not try to reconnect.
    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}
