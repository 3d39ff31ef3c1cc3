#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use eventspine::{
    Backend, DeadLetter, DeadLetterStore, Emit, Error, Event, Handler, Health, MemoryBackend,
    Result, Subscribe,
};
use serde_json::{Value, json};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn event(event_type: &str) -> Event {
    Event::new(event_type, Value::Null).unwrap()
}

/// Answers `HELLO` with `GREETED`.
pub struct Greeter;

impl Handler for Greeter {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("HELLO")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let name = event.get("name").and_then(Value::as_str).unwrap_or("stranger");
        Ok(Event::new("GREETED", json!({ "msg": format!("Hello, {name}!") }))?.into())
    }
}

/// Collects the `msg` of every `GREETED` event.
pub struct Inbox(pub Arc<Mutex<Vec<String>>>);

impl Handler for Inbox {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("GREETED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let msg = event.get("msg").and_then(Value::as_str).unwrap_or_default();
        self.0.lock().unwrap().push(msg.to_owned());
        Ok(Emit::none())
    }
}

/// Always fails.
pub struct Broken(pub &'static str);

impl Handler for Broken {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from(self.0)
    }

    async fn process(&mut self, _event: &Event) -> Result<Emit> {
        Err(Error::handler("parse error"))
    }
}

/// Emits one event of the given type for every event it receives.
pub struct Relay {
    pub from: &'static str,
    pub to: &'static str,
}

impl Handler for Relay {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from(self.from)
    }

    async fn process(&mut self, _event: &Event) -> Result<Emit> {
        Ok(Event::new(self.to, Value::Null)?.into())
    }
}

/// Dead-letter store whose writes always fail.
pub struct RefusingStore;

impl DeadLetterStore for RefusingStore {
    async fn store(&self, _record: DeadLetter) -> Result<()> {
        Err(Error::Transport("dead-letter stream unavailable".into()))
    }
}

/// In-memory backend with scripted failures.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    rejected: Mutex<Option<(String, u32)>>,
    pull_failures: AtomicU32,
    ack_failures: AtomicU32,
    redelivers: bool,
    pub enqueue_calls: AtomicU32,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` enqueues of `event_type`.
    pub fn reject(self, event_type: &str, times: u32) -> Self {
        *self.rejected.lock().unwrap() = Some((event_type.to_owned(), times));
        self
    }

    pub fn fail_pulls(self, times: u32) -> Self {
        self.pull_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn fail_acks(self, times: u32) -> Self {
        self.ack_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Claim that unacked events come back, like a durable backend.
    pub fn redelivering(mut self) -> Self {
        self.redelivers = true;
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn should_reject(&self, event: &Event) -> bool {
        let mut rejected = self.rejected.lock().unwrap();
        match rejected.as_mut() {
            Some((t, left)) if t == event.event_type() && *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Backend for FlakyBackend {
    async fn enqueue(&self, event: &Event) -> Result<()> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_reject(event) {
            return Err(Error::Transport("connection reset".into()));
        }
        self.inner.enqueue(event).await
    }

    async fn pull(&self, timeout: Duration) -> Result<Option<Event>> {
        if Self::take(&self.pull_failures) {
            return Err(Error::Transport("connection refused".into()));
        }
        self.inner.pull(timeout).await
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        if Self::take(&self.ack_failures) {
            return Err(Error::Backend("ack rejected".into()));
        }
        self.inner.ack(event).await
    }

    async fn nack(&self, event: &Event, reason: &str) -> Result<()> {
        self.inner.nack(event, reason).await
    }

    async fn health(&self) -> Health {
        self.inner.health().await
    }

    fn redelivers(&self) -> bool {
        self.redelivers
    }
}
