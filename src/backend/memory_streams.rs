use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use crate::{
    Error, Result,
    backend::{PendingEntry, StreamClient, StreamEntry, StreamStats},
};

/// In-process stream server with consumer groups.
///
/// Behaves like Redis Streams for the commands [`StreamClient`] uses, so the
/// durable protocol can run without a server. Idle times follow tokio's
/// clock, which makes them controllable in `start_paused` tests. Every clone
/// is a separate connection to the same streams.
///
/// Faults can be injected to exercise reconnection:
///
/// - [`fail_next`](Self::fail_next) - the next `n` commands fail
/// - [`disconnect`](Self::disconnect) - commands fail until a reconnect
/// - [`set_reachable`](Self::set_reachable) - reconnects fail too
#[derive(Debug, Default)]
pub struct MemoryStreams {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Clone for MemoryStreams {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Stream>,
    failures_queued: u32,
    disconnected: bool,
    unreachable: bool,
    reconnects: u64,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, HashMap<String, String>>,
    last_seq: u64,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Delivery>,
}

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commands fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures_queued = n;
    }

    /// Drop the connection; commands fail until [`StreamClient::reconnect`].
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// While unreachable, both commands and reconnects fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Successful reconnects so far.
    pub fn reconnect_count(&self) -> u64 {
        self.lock().reconnects
    }

    /// Number of entries in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// All entries of `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let state = self.lock();
        let Some(s) = state.streams.get(stream) else {
            return Vec::new();
        };
        s.entries
            .iter()
            .map(|(seq, fields)| entry(*seq, fields))
            .collect()
    }

    /// Delivery count of a pending entry.
    pub fn deliveries(&self, stream: &str, group: &str, id: &str) -> Option<u64> {
        let seq = parse_id(id).ok()?;
        let state = self.lock();
        let delivery = state.streams.get(stream)?.groups.get(group)?.pending.get(&seq)?;
        Some(delivery.deliveries)
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Whether this connection was closed with [`StreamClient::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a command against the state, honoring injected faults.
    fn command<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        if self.is_closed() {
            return Err(Error::backend("connection closed"));
        }
        let mut state = self.lock();
        if state.unreachable || state.disconnected {
            return Err(Error::transport("connection refused"));
        }
        if state.failures_queued > 0 {
            state.failures_queued -= 1;
            return Err(Error::transport("connection reset by peer"));
        }
        f(&mut state)
    }
}

impl State {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<(&mut Group, &BTreeMap<u64, HashMap<String, String>>)> {
        let s = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        Ok((g, &s.entries))
    }

    fn deliver_next(&mut self, stream: &str, group: &str, consumer: &str) -> Result<Option<StreamEntry>> {
        let (g, entries) = self.group_mut(stream, group)?;
        let Some((&seq, fields)) = entries.range(g.last_delivered + 1..).next() else {
            return Ok(None);
        };
        g.last_delivered = seq;
        g.pending.insert(
            seq,
            Delivery {
                consumer: consumer.to_owned(),
                delivered_at: Instant::now(),
                deliveries: 1,
            },
        );
        Ok(Some(entry(seq, fields)))
    }
}

impl StreamClient for MemoryStreams {
    async fn ping(&self) -> Result<()> {
        self.command(|_| Ok(()))
    }

    async fn reconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::backend("connection closed"));
        }
        let mut state = self.lock();
        if state.unreachable {
            return Err(Error::transport("connection refused"));
        }
        state.disconnected = false;
        state.reconnects += 1;
        Ok(())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        self.command(|state| {
            let s = state.streams.entry(stream.to_owned()).or_default();
            s.groups.entry(group.to_owned()).or_default();
            Ok(())
        })
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let id = self.command(|state| {
            let s = state.streams.entry(stream.to_owned()).or_default();
            s.last_seq += 1;
            let fields = fields
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect();
            s.entries.insert(s.last_seq, fields);
            Ok(entry_id(s.last_seq))
        })?;
        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.command(|state| state.deliver_next(stream, group, consumer))? {
                return Ok(Some(entry));
            }
            if block.is_zero() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        self.command(|state| {
            let (g, _) = state.group_mut(stream, group)?;
            Ok(g.pending
                .iter()
                .take(count)
                .map(|(seq, d)| PendingEntry {
                    id: entry_id(*seq),
                    consumer: d.consumer.clone(),
                    idle: d.delivered_at.elapsed(),
                    deliveries: d.deliveries,
                })
                .collect())
        })
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> Result<Option<StreamEntry>> {
        let seq = parse_id(id)?;
        self.command(|state| {
            let (g, entries) = state.group_mut(stream, group)?;
            let Some(delivery) = g.pending.get_mut(&seq) else {
                return Ok(None);
            };
            if delivery.delivered_at.elapsed() < min_idle {
                return Ok(None);
            }
            let Some(fields) = entries.get(&seq) else {
                g.pending.remove(&seq);
                return Ok(None);
            };
            delivery.consumer = consumer.to_owned();
            delivery.delivered_at = Instant::now();
            delivery.deliveries += 1;
            Ok(Some(entry(seq, fields)))
        })
    }

    async fn range(&self, stream: &str, start: &str, end: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let (start, end) = (parse_id(start)?, parse_id(end)?);
        self.command(|state| {
            let Some(s) = state.streams.get(stream) else {
                return Ok(Vec::new());
            };
            if start > end {
                return Ok(Vec::new());
            }
            Ok(s.entries
                .range(start..=end)
                .take(count)
                .map(|(seq, fields)| entry(*seq, fields))
                .collect())
        })
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let seq = parse_id(id)?;
        self.command(|state| {
            if let Ok((g, _)) = state.group_mut(stream, group) {
                g.pending.remove(&seq);
            }
            Ok(())
        })
    }

    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats> {
        self.command(|state| {
            let Some(s) = state.streams.get(stream) else {
                return Ok(StreamStats::default());
            };
            let g = s.groups.get(group);
            Ok(StreamStats {
                length: s.entries.len() as u64,
                pending: g.map_or(0, |g| g.pending.len() as u64),
                lag: g.map(|g| s.entries.range(g.last_delivered + 1..).count() as u64),
            })
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn entry(seq: u64, fields: &HashMap<String, String>) -> StreamEntry {
    StreamEntry {
        id: entry_id(seq),
        fields: fields.clone(),
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64> {
    match id {
        "-" => Ok(0),
        "+" => Ok(u64::MAX),
        _ => id
            .split('-')
            .next()
            .and_then(|ms| ms.parse().ok())
            .ok_or_else(|| Error::backend(format!("invalid stream id '{id}'"))),
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::backend(format!("NOGROUP no such key '{stream}' or consumer group '{group}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "test:events";
    const GROUP: &str = "workers";

    async fn seeded(n: usize) -> MemoryStreams {
        let streams = MemoryStreams::new();
        streams.create_group(STREAM, GROUP).await.unwrap();
        for i in 0..n {
            let value = i.to_string();
            streams.append(STREAM, &[("n", value.as_str())]).await.unwrap();
        }
        streams
    }

    #[tokio::test]
    async fn test_group_reads_each_entry_once() {
        let streams = seeded(2).await;
        let first = streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap().unwrap();
        let second = streams.read_group(STREAM, GROUP, "b", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.field("n"), Some("0"));
        assert_eq!(second.field("n"), Some("1"));
        assert!(streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(streams.pending_count(STREAM, GROUP), 2);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let streams = MemoryStreams::new();
        let err = streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_requires_idle_and_counts_deliveries() {
        let streams = seeded(1).await;
        let entry = streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap().unwrap();

        let early = streams
            .claim(STREAM, GROUP, "b", Duration::from_secs(30), &entry.id)
            .await
            .unwrap();
        assert!(early.is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = streams
            .claim(STREAM, GROUP, "b", Duration::from_secs(30), &entry.id)
            .await
            .unwrap();
        assert_eq!(claimed, Some(entry.clone()));
        assert_eq!(streams.deliveries(STREAM, GROUP, &entry.id), Some(2));

        let pending = streams.pending(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "b");
        assert_eq!(pending[0].idle, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let streams = seeded(1).await;
        let entry = streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap().unwrap();
        streams.ack(STREAM, GROUP, &entry.id).await.unwrap();
        streams.ack(STREAM, GROUP, &entry.id).await.unwrap();
        assert_eq!(streams.pending_count(STREAM, GROUP), 0);
        assert_eq!(streams.len(STREAM), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let streams = seeded(0).await;
        let producer = streams.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.append(STREAM, &[("n", "late")]).await.unwrap();
        });

        let entry = streams
            .read_group(STREAM, GROUP, "a", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(entry.and_then(|e| e.field("n").map(str::to_owned)).as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_range_and_stats() {
        let streams = seeded(3).await;
        streams.read_group(STREAM, GROUP, "a", Duration::ZERO).await.unwrap();

        let all = streams.range(STREAM, "-", "+", 10).await.unwrap();
        assert_eq!(all.len(), 3);
        let one = streams.range(STREAM, &all[1].id, &all[1].id, 1).await.unwrap();
        assert_eq!(one, vec![all[1].clone()]);

        let stats = streams.stats(STREAM, GROUP).await.unwrap();
        assert_eq!(stats, StreamStats { length: 3, pending: 1, lag: Some(2) });
        assert_eq!(streams.stats("missing", GROUP).await.unwrap(), StreamStats::default());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let streams = seeded(0).await;
        streams.fail_next(2);
        assert!(streams.ping().await.unwrap_err().is_transport());
        assert!(streams.ping().await.unwrap_err().is_transport());
        assert!(streams.ping().await.is_ok());

        streams.disconnect();
        assert!(streams.ping().await.is_err());
        streams.reconnect().await.unwrap();
        assert!(streams.ping().await.is_ok());
        assert_eq!(streams.reconnect_count(), 1);

        streams.set_reachable(false);
        assert!(streams.reconnect().await.is_err());
        assert_eq!(streams.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_per_connection() {
        let streams = seeded(1).await;
        let other = streams.clone();
        streams.close().await.unwrap();

        let err = streams.ping().await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(streams.reconnect().await.is_err());
        assert!(other.ping().await.is_ok());
        assert_eq!(other.len(STREAM), 1);
    }
}
