use std::{
    collections::{HashMap, HashSet},
    future::Future,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    DeadLetter, DeadLetterStore, Error, Event, Result,
    backend::{
        Backend, BackendMetrics, Health, MetricsSnapshot, PendingEntry, StreamClient, StreamEntry,
    },
    internal::exponential,
};

/// Configuration of a [`StreamBackend`].
///
/// ```rust
/// use std::time::Duration;
/// use eventspine::backend::StreamConfig;
///
/// let config = StreamConfig::default()
///     .with_stream("orders")
///     .with_group("billing")
///     .with_max_retries(5)
///     .with_claim_min_idle(Duration::from_secs(60));
/// assert_eq!(config.dead_letter_stream(), "orders:dlq");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Used by [`StreamBackend::connect`]. Default: `redis://127.0.0.1:6379`
    pub redis_url: String,

    /// Default: `spine:events`
    pub stream: String,

    /// Consumer group shared by all cooperating Spines. Default: `spine`
    pub group: String,

    /// Name of this consumer within the group; must be unique per process.
    /// Default: `consumer-` followed by 8 random hex digits
    pub consumer: String,

    /// Default: `None`, meaning `<stream>:dlq`
    pub dead_letter_stream: Option<String>,

    /// Deliveries after which an unacknowledged entry is dead-lettered
    /// instead of reclaimed. Default: 3
    pub max_retries: u64,

    /// How long an entry must sit unacknowledged before another consumer
    /// may reclaim it. Default: 30 s
    pub claim_min_idle: Duration,

    /// Pending entries inspected per pull. Default: 10
    pub claim_batch: usize,

    /// Reconnects tried before a transport failure is surfaced. Default: 3
    pub reconnect_attempts: u32,

    /// Delay before the first reconnect; doubles on every further attempt.
    /// Default: 100 ms
    pub reconnect_base_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            stream: "spine:events".to_owned(),
            group: "spine".to_owned(),
            consumer: format!("consumer-{}", &Uuid::new_v4().simple().to_string()[..8]),
            dead_letter_stream: None,
            max_retries: 3,
            claim_min_idle: Duration::from_secs(30),
            claim_batch: 10,
            reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(100),
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `SPINE_REDIS_URL` (or `REDIS_URL`), `SPINE_STREAM`,
    /// `SPINE_GROUP`, `SPINE_CONSUMER`, `SPINE_MAX_RETRIES` and
    /// `SPINE_CLAIM_IDLE_MS`. Unparsable numbers are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SPINE_REDIS_URL").or_else(|_| std::env::var("REDIS_URL")) {
            config.redis_url = url;
        }
        if let Ok(stream) = std::env::var("SPINE_STREAM") {
            config.stream = stream;
        }
        if let Ok(group) = std::env::var("SPINE_GROUP") {
            config.group = group;
        }
        if let Ok(consumer) = std::env::var("SPINE_CONSUMER") {
            config.consumer = consumer;
        }
        if let Some(retries) = env_number("SPINE_MAX_RETRIES") {
            config.max_retries = retries;
        }
        if let Some(ms) = env_number("SPINE_CLAIM_IDLE_MS") {
            config.claim_min_idle = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter_stream = Some(stream.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }

    pub fn with_claim_batch(mut self, batch: usize) -> Self {
        self.claim_batch = batch;
        self
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    pub fn dead_letter_stream(&self) -> String {
        self.dead_letter_stream
            .clone()
            .unwrap_or_else(|| format!("{}:dlq", self.stream))
    }
}

fn env_number<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring unparsable environment variable");
    }
    parsed
}

/// Durable backend over a consumer-group stream.
///
/// Every emitted event is appended as an entry with a single `event` field
/// holding its JSON. Pulled entries stay pending in the group until acked.
/// Entries left unacknowledged for [`claim_min_idle`](StreamConfig::claim_min_idle)
/// are reclaimed by whichever consumer pulls next, and dead-lettered once
/// they were delivered [`max_retries`](StreamConfig::max_retries) times.
/// Delivery is at-least-once.
///
/// The backend doubles as a [`DeadLetterStore`] appending to its dead-letter
/// stream, so share it through an `Arc` to use it for both.
pub struct StreamBackend<C: StreamClient> {
    client: C,
    config: StreamConfig,
    dead_letter_stream: String,
    metrics: Arc<BackendMetrics>,
    in_flight: Mutex<HashMap<Uuid, String>>,
    group_ready: AtomicBool,
}

#[cfg(feature = "redis")]
impl StreamBackend<crate::backend::RedisStreams> {
    /// Connect to the Redis server at [`StreamConfig::redis_url`].
    pub async fn connect(config: StreamConfig) -> Result<Self> {
        let client = crate::backend::RedisStreams::connect(&config.redis_url).await?;
        Ok(Self::new(client, config))
    }
}

impl<C: StreamClient> StreamBackend<C> {
    pub fn new(client: C, config: StreamConfig) -> Self {
        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "stream backend ready"
        );
        Self {
            dead_letter_stream: config.dead_letter_stream(),
            client,
            config,
            metrics: Arc::default(),
            in_flight: Mutex::default(),
            group_ready: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter_stream
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The oldest `count` records of the dead-letter stream.
    pub async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetter>> {
        let entries = self
            .with_reconnect("range", || {
                self.client.range(&self.dead_letter_stream, "-", "+", count)
            })
            .await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_dead_letter(&entry) {
                Ok(record) => records.push(record),
                Err(e) => warn!(entry_id = %entry.id, error = %e, "skipping unreadable dead-letter entry"),
            }
        }
        Ok(records)
    }

    /// Run a client command, reconnecting with exponential backoff when it
    /// fails at the transport level.
    async fn with_reconnect<T, F, Fut>(&self, op: &'static str, mut command: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let e = match command().await {
                Err(e) if e.is_transport() => e,
                other => return other,
            };
            if attempt >= self.config.reconnect_attempts {
                error!(op, attempts = attempt, error = %e, "stream server unreachable");
                return Err(Error::backend(format!(
                    "{op} failed after {attempt} reconnect attempt(s): {e}"
                )));
            }

            let delay = exponential(self.config.reconnect_base_delay, attempt);
            attempt += 1;
            warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "stream transport failure, reconnecting");
            tokio::time::sleep(delay).await;

            match self.client.reconnect().await {
                Ok(()) => {
                    BackendMetrics::incr(&self.metrics.reconnections);
                    self.group_ready.store(false, Ordering::Release);
                    info!(op, attempt, "reconnected to stream server");
                }
                Err(e) => warn!(op, attempt, error = %e, "reconnect failed"),
            }
        }
    }

    async fn ensure_group(&self) -> Result<()> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.with_reconnect("create_group", || {
            self.client.create_group(&self.config.stream, &self.config.group)
        })
        .await?;
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Reclaim or dead-letter entries abandoned by their consumer.
    async fn recover_pending(&self) -> Result<Option<Event>> {
        let tracked: HashSet<Uuid> = self.in_flight().keys().copied().collect();
        let pending = self
            .with_reconnect("pending", || {
                self.client
                    .pending(&self.config.stream, &self.config.group, self.config.claim_batch)
            })
            .await?;
        self.release_stale(&tracked, &pending);

        for entry in pending {
            if entry.idle < self.config.claim_min_idle {
                continue;
            }
            if entry.deliveries >= self.config.max_retries {
                let reason = format!("exceeded {} deliveries", self.config.max_retries);
                self.move_to_dead_letter(&entry.id, &reason).await;
                continue;
            }

            let claimed = self
                .with_reconnect("claim", || {
                    self.client.claim(
                        &self.config.stream,
                        &self.config.group,
                        &self.config.consumer,
                        self.config.claim_min_idle,
                        &entry.id,
                    )
                })
                .await;
            let claimed = match claimed {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "failed to claim pending entry");
                    continue;
                }
            };

            match self.decode(&claimed) {
                Ok(event) => {
                    BackendMetrics::incr(&self.metrics.pending_recovered);
                    BackendMetrics::incr(&self.metrics.pulled);
                    info!(
                        entry_id = %claimed.id,
                        event_id = %event.id(),
                        previous_consumer = %entry.consumer,
                        delivery = entry.deliveries + 1,
                        "reclaimed pending entry"
                    );
                    return Ok(Some(event));
                }
                Err(e) => {
                    self.move_to_dead_letter(&claimed.id, &format!("undecodable entry: {e}"))
                        .await;
                }
            }
        }
        Ok(None)
    }

    /// Forget tracked events whose entries this consumer no longer holds:
    /// acked elsewhere, claimed by another consumer or dead-lettered. An
    /// entry missing from a partial pending batch may still be ours.
    fn release_stale(&self, tracked: &HashSet<Uuid>, pending: &[PendingEntry]) {
        let complete = pending.len() < self.config.claim_batch;
        let holder: HashMap<&str, &str> = pending
            .iter()
            .map(|p| (p.id.as_str(), p.consumer.as_str()))
            .collect();

        let mut in_flight = self.in_flight();
        let before = in_flight.len();
        in_flight.retain(|event_id, entry_id| {
            if !tracked.contains(event_id) {
                return true;
            }
            match holder.get(entry_id.as_str()) {
                Some(consumer) => *consumer == self.config.consumer,
                None => !complete,
            }
        });
        let released = before - in_flight.len();
        if released > 0 {
            debug!(released, "released entries no longer held by this consumer");
        }
    }

    /// Copy a main-stream entry to the dead-letter stream and ack it.
    /// Failures are logged; the entry stays pending and is retried later.
    async fn move_to_dead_letter(&self, entry_id: &str, reason: &str) {
        self.in_flight().retain(|_, id| id.as_str() != entry_id);
        match self.try_move_to_dead_letter(entry_id, reason).await {
            Ok(()) => warn!(entry_id, reason, "moved entry to dead-letter stream"),
            Err(e) => error!(entry_id, reason, error = %e, "failed to dead-letter entry"),
        }
    }

    async fn try_move_to_dead_letter(&self, entry_id: &str, reason: &str) -> Result<()> {
        let entries = self
            .with_reconnect("range", || {
                self.client.range(&self.config.stream, entry_id, entry_id, 1)
            })
            .await?;

        if let Some(entry) = entries.first() {
            let failed_at = Utc::now().to_rfc3339();
            let fields = [
                ("original_id", entry_id),
                ("event", entry.field("event").unwrap_or("{}")),
                ("reason", reason),
                ("failed_at", failed_at.as_str()),
            ];
            self.with_reconnect("append", || {
                self.client.append(&self.dead_letter_stream, &fields)
            })
            .await?;
        }

        self.with_reconnect("ack", || {
            self.client.ack(&self.config.stream, &self.config.group, entry_id)
        })
        .await?;
        BackendMetrics::incr(&self.metrics.failed);
        Ok(())
    }

    /// Decode an entry and remember which entry the event came from.
    fn decode(&self, entry: &StreamEntry) -> Result<Event> {
        let json = entry
            .field("event")
            .ok_or_else(|| Error::validation("stream entry has no 'event' field"))?;
        let event = Event::from_json(json)?;
        self.in_flight().insert(event.id(), entry.id.clone());
        Ok(event)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop tracking `event`, returning the entry it came from.
    fn release(&self, event: &Event) -> Option<String> {
        self.in_flight().remove(&event.id())
    }

    /// Number of pulled events not yet acked or nacked.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }
}

impl<C: StreamClient> Backend for StreamBackend<C> {
    async fn enqueue(&self, event: &Event) -> Result<()> {
        self.ensure_group().await?;
        let json = event.to_json()?;
        let fields = [("event", json.as_str())];
        let entry_id = self
            .with_reconnect("append", || self.client.append(&self.config.stream, &fields))
            .await?;
        BackendMetrics::incr(&self.metrics.enqueued);
        debug!(event_id = %event.id(), event_type = event.event_type(), %entry_id, "appended event");
        Ok(())
    }

    async fn pull(&self, timeout: Duration) -> Result<Option<Event>> {
        self.ensure_group().await?;
        if let Some(event) = self.recover_pending().await? {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let block = deadline.saturating_duration_since(Instant::now());
            let entry = self
                .with_reconnect("read_group", || {
                    self.client.read_group(
                        &self.config.stream,
                        &self.config.group,
                        &self.config.consumer,
                        block,
                    )
                })
                .await?;
            let Some(entry) = entry else {
                return Ok(None);
            };

            match self.decode(&entry) {
                Ok(event) => {
                    BackendMetrics::incr(&self.metrics.pulled);
                    return Ok(Some(event));
                }
                Err(e) => {
                    self.move_to_dead_letter(&entry.id, &format!("undecodable entry: {e}"))
                        .await;
                }
            }
        }
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        // Released up front: a failed XACK leaves the entry pending for reclaim.
        let Some(entry_id) = self.release(event) else {
            warn!(event_id = %event.id(), "ack for an event this consumer did not pull, ignoring");
            return Ok(());
        };
        self.with_reconnect("ack", || {
            self.client.ack(&self.config.stream, &self.config.group, &entry_id)
        })
        .await?;
        BackendMetrics::incr(&self.metrics.acked);
        debug!(event_id = %event.id(), %entry_id, "acked entry");
        Ok(())
    }

    async fn nack(&self, event: &Event, reason: &str) -> Result<()> {
        let Some(entry_id) = self.release(event) else {
            warn!(event_id = %event.id(), "nack for an event this consumer did not pull, ignoring");
            return Ok(());
        };

        let json = event.to_json()?;
        let failed_at = Utc::now().to_rfc3339();
        let fields = [
            ("original_id", entry_id.as_str()),
            ("event", json.as_str()),
            ("reason", reason),
            ("failed_at", failed_at.as_str()),
        ];
        self.with_reconnect("append", || {
            self.client.append(&self.dead_letter_stream, &fields)
        })
        .await?;
        self.with_reconnect("ack", || {
            self.client.ack(&self.config.stream, &self.config.group, &entry_id)
        })
        .await?;

        BackendMetrics::incr(&self.metrics.failed);
        warn!(event_id = %event.id(), %entry_id, reason, "nacked entry to dead-letter stream");
        Ok(())
    }

    async fn health(&self) -> Health {
        let start = std::time::Instant::now();
        let probe = async {
            self.client.ping().await?;
            self.client.stats(&self.config.stream, &self.config.group).await
        };
        let result = probe.await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(stats) => Health {
                healthy: true,
                latency_ms,
                details: json!({
                    "backend": "stream",
                    "stream": self.config.stream,
                    "group": self.config.group,
                    "consumer": self.config.consumer,
                    "stream_length": stats.length,
                    "pending": stats.pending,
                    "lag": stats.lag,
                    "metrics": self.metrics(),
                }),
            },
            Err(e) => Health {
                healthy: false,
                latency_ms,
                details: json!({ "backend": "stream", "error": e.to_string() }),
            },
        }
    }

    fn redelivers(&self) -> bool {
        true
    }

    /// Close the client. Events still in flight stay pending in the group
    /// and are reclaimed by another consumer.
    async fn close(&self) -> Result<()> {
        let abandoned = std::mem::take(&mut *self.in_flight()).len();
        self.group_ready.store(false, Ordering::Release);
        self.client.close().await?;
        info!(consumer = %self.config.consumer, abandoned, "stream backend closed");
        Ok(())
    }
}

impl<C: StreamClient> DeadLetterStore for StreamBackend<C> {
    async fn store(&self, record: DeadLetter) -> Result<()> {
        let json = record.event.to_json()?;
        let failed_at = record.failed_at.to_rfc3339();
        let fields = [
            ("event", json.as_str()),
            ("reason", record.reason.as_str()),
            ("failed_at", failed_at.as_str()),
        ];
        self.with_reconnect("append", || {
            self.client.append(&self.dead_letter_stream, &fields)
        })
        .await?;
        Ok(())
    }
}

fn decode_dead_letter(entry: &StreamEntry) -> Result<DeadLetter> {
    let event = Event::from_json(entry.field("event").unwrap_or_default())?;
    let failed_at = match entry.field("failed_at") {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| Error::validation(format!("bad failed_at '{raw}': {e}")))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    Ok(DeadLetter {
        event,
        reason: entry.field("reason").unwrap_or_default().to_owned(),
        failed_at,
    })
}
