use std::{sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Backend, Config, DeadLetter, DeadLetterStore, EnqueueFailureMode, Error, Event, Handler,
    HandlerFailureMode, MemoryDeadLetters, Result, SpineStats,
    internal::{Route, exponential},
    monitoring::{DispatchRecord, Monitor, Stage},
    stats::SharedStats,
};

/// The dispatcher: pulls events from a [`Backend`], routes each one to the
/// handlers subscribed to its type, and enqueues whatever they emit.
///
/// - Register handlers with [`add_handler`](Self::add_handler) or through
///   [`Spine::builder`].
/// - [`run`](Self::run) loops until the backend is drained, a stop is
///   requested, or a fatal error occurs.
/// - [`handle`](Self::handle) gives a cloneable [`SpineHandle`] to stop the
///   loop and read its statistics from other tasks.
///
/// Events are processed one at a time. Handlers for one event run
/// sequentially in registration order.
///
/// ```rust
/// use eventspine::{Emit, Event, Handler, MemoryBackend, Result, Spine, Subscribe};
/// use serde_json::json;
///
/// struct Greeter;
///
/// impl Handler for Greeter {
///     fn subscriptions(&self) -> Subscribe {
///         Subscribe::from("HELLO")
///     }
///
///     async fn process(&mut self, event: &Event) -> Result<Emit> {
///         let name = event.get("name").and_then(|v| v.as_str()).unwrap_or("world");
///         Ok(Event::new("GREETED", json!({ "msg": format!("Hello, {name}!") }))?.into())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<()> {
/// let mut spine = Spine::new(MemoryBackend::new());
/// spine.add_handler(Greeter)?;
///
/// let stats = spine.run(Some(Event::new("HELLO", json!({ "name": "Ada" }))?)).await?;
/// assert_eq!(stats.dispatches, 1);
/// # Ok(())
/// # }
/// ```
pub struct Spine<B: Backend, S: DeadLetterStore = MemoryDeadLetters> {
    routes: Vec<Route>,
    backend: B,
    dead_letters: S,
    config: Config,
    stats: Arc<SharedStats>,
    cancel_token: CancellationToken,
    monitors: Vec<Box<dyn Monitor>>,
}

impl<B: Backend> Spine<B> {
    /// A Spine with the default [`Config`] and an in-memory dead-letter store.
    pub fn new(backend: B) -> Self {
        Self::builder(backend).into_spine()
    }

    pub fn builder(backend: B) -> SpineBuilder<B> {
        SpineBuilder::new(backend)
    }
}

impl<B: Backend, S: DeadLetterStore> Spine<B, S> {
    /// Register a handler. Routing follows registration order.
    ///
    /// Fails with [`Error::Registration`] when the handler subscribes to
    /// nothing or to a blank event type.
    pub fn add_handler<H: Handler>(&mut self, handler: H) -> Result<()> {
        let route = Route::new(handler)?;
        debug!(handler = %route.name, event_types = ?route.subscribe.event_types(), "handler registered");
        self.routes.push(route);
        Ok(())
    }

    pub fn add_monitor<M: Monitor + 'static>(&mut self, monitor: M) {
        self.monitors.push(Box::new(monitor));
    }

    /// Names of the registered handlers, in routing order.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.name.as_ref())
    }

    pub fn handle(&self) -> SpineHandle {
        SpineHandle {
            cancel_token: self.cancel_token.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Request a stop. The loop exits before its next pull; an event being
    /// processed is finished first. A stopped Spine stays stopped.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Statistics of the current or last run.
    pub fn stats(&self) -> SpineStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn dead_letters(&self) -> &S {
        &self.dead_letters
    }

    /// Run the dispatch loop.
    ///
    /// The optional `seed` is enqueued first; failing to enqueue it is
    /// returned as is. The loop then ends normally when a pull finds
    /// nothing within [`Config::pull_timeout`] or a stop was requested.
    ///
    /// It aborts with [`Error::StepBudgetExceeded`],
    /// [`Error::BackendUnavailable`], or [`Error::Enqueue`] (under the
    /// `Fail` and `Retry` enqueue policies). Handler errors never abort it.
    pub async fn run(&mut self, seed: Option<Event>) -> Result<SpineStats> {
        self.stats.reset();
        info!(
            handlers = self.routes.len(),
            max_steps = self.config.max_steps,
            enqueue_failure_mode = %self.config.enqueue_failure_mode,
            handler_failure_mode = %self.config.handler_failure_mode,
            "spine starting"
        );

        let result = self.run_loop(seed).await;
        let stats = self.stats.snapshot();
        for monitor in &self.monitors {
            monitor.on_run_end(&stats);
        }

        match result {
            Ok(()) => {
                info!(
                    steps = stats.steps,
                    events_processed = stats.events_processed,
                    dead_lettered = stats.dead_lettered,
                    "spine finished"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(steps = stats.steps, error = %e, "spine aborted");
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, seed: Option<Event>) -> Result<()> {
        if let Some(seed) = seed {
            self.backend.enqueue(&seed).await?;
            self.observe(DispatchRecord::new(Stage::Seeded, &seed));
        }

        let mut steps = 0u64;
        let mut consecutive_failures = 0u32;
        loop {
            if self.cancel_token.is_cancelled() {
                info!(steps, "stop requested");
                return Ok(());
            }

            steps += 1;
            self.stats.update(|s| s.steps = steps);
            if steps > self.config.max_steps {
                return Err(Error::StepBudgetExceeded(self.config.max_steps));
            }

            let event = match self.backend.pull(self.config.pull_timeout).await {
                Ok(Some(event)) => {
                    consecutive_failures = 0;
                    event
                }
                Ok(None) => {
                    debug!(steps, "backend drained");
                    return Ok(());
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.stats.update(|s| s.backend_errors += 1);
                    warn!(
                        consecutive_failures,
                        limit = self.config.max_consecutive_backend_failures,
                        error = %e,
                        "pull failed"
                    );
                    if consecutive_failures >= self.config.max_consecutive_backend_failures {
                        return Err(Error::BackendUnavailable {
                            failures: consecutive_failures,
                            last_error: e.to_string().into(),
                        });
                    }
                    continue;
                }
            };

            self.process(event).await?;
            tokio::task::yield_now().await;
        }
    }

    async fn process(&mut self, event: Event) -> Result<()> {
        self.stats.update(|s| s.events_processed += 1);
        self.observe(DispatchRecord::new(Stage::Pulled, &event));

        let mut ack = true;
        for idx in 0..self.routes.len() {
            if !self.routes[idx].accepts(&event) {
                continue;
            }
            let name = self.routes[idx].name.clone();
            self.stats.update(|s| s.dispatches += 1);
            self.observe(DispatchRecord::new(Stage::Dispatched, &event).with_handler(&name));

            let started = Instant::now();
            match self.invoke(idx, &event).await {
                Ok(emit) => {
                    self.observe(
                        DispatchRecord::new(Stage::Completed, &event)
                            .with_handler(&name)
                            .with_elapsed(started.elapsed())
                            .with_detail(format!("{} event(s) emitted", emit.len())),
                    );
                    for emitted in emit {
                        ack &= self.enqueue_emitted(&event, &name, emitted).await?;
                    }
                }
                Err(e) => {
                    ack &= self.handler_failed(&event, &name, e, started).await;
                }
            }
        }

        if ack {
            self.ack(&event).await;
        } else {
            self.observe(DispatchRecord::new(Stage::Unacked, &event));
        }
        Ok(())
    }

    async fn invoke(&mut self, idx: usize, event: &Event) -> Result<crate::Emit> {
        let timeout = self.config.handler_timeout;
        let future = self.routes[idx].process(event);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => future.await,
        }
    }

    /// Apply the handler failure policy. Returns whether the event may be acked.
    async fn handler_failed(
        &mut self,
        event: &Event,
        handler: &Arc<str>,
        error: Error,
        started: Instant,
    ) -> bool {
        self.stats.update(|s| *s.handler_errors.entry(handler.to_string()).or_default() += 1);
        self.observe(
            DispatchRecord::new(Stage::HandlerFailed, event)
                .with_handler(handler)
                .with_elapsed(started.elapsed())
                .with_detail(error.to_string()),
        );

        match self.config.handler_failure_mode {
            HandlerFailureMode::Log => true,
            HandlerFailureMode::Store => {
                let reason = format!("handler '{handler}' failed: {error}");
                let stored = self.dead_letter(DeadLetter::new(event.clone(), reason)).await;
                stored || !self.backend.redelivers()
            }
            HandlerFailureMode::Nack if self.backend.redelivers() => false,
            HandlerFailureMode::Nack => {
                debug!(event_id = %event.id(), "backend does not redeliver, acking nacked event");
                true
            }
        }
    }

    /// Enqueue one emitted event under the enqueue failure policy.
    /// Returns whether the parent may be acked.
    async fn enqueue_emitted(&mut self, parent: &Event, handler: &Arc<str>, event: Event) -> Result<bool> {
        let error = match self.backend.enqueue(&event).await {
            Ok(()) => {
                self.emitted(parent, handler, &event);
                return Ok(true);
            }
            Err(e) => e,
        };

        let mode = self.config.enqueue_failure_mode;
        self.stats.update(|s| {
            *s.enqueue_failures.entry(event.event_type().to_owned()).or_default() += 1;
        });
        self.observe(
            DispatchRecord::new(Stage::EnqueueFailed, &event)
                .with_parent(parent)
                .with_handler(handler)
                .with_detail(format!("{error} (mode: {mode})")),
        );

        match mode {
            EnqueueFailureMode::Fail => Err(Error::Enqueue {
                event_id: event.id(),
                attempts: 1,
                source: Box::new(error),
            }),
            EnqueueFailureMode::Retry => {
                self.retry_enqueue(parent, handler, event, error).await?;
                Ok(true)
            }
            EnqueueFailureMode::Store => {
                let reason = format!("enqueue failed: {error}");
                let stored = self.dead_letter(DeadLetter::new(event, reason)).await;
                Ok(stored || !self.backend.redelivers())
            }
        }
    }

    async fn retry_enqueue(
        &mut self,
        parent: &Event,
        handler: &Arc<str>,
        event: Event,
        mut last_error: Error,
    ) -> Result<()> {
        let retries = self.config.retry_attempts;
        for attempt in 0..retries {
            let delay = exponential(self.config.retry_base_delay, attempt);
            warn!(
                event_id = %event.id(),
                event_type = event.event_type(),
                retry = attempt + 1,
                of = retries,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying enqueue"
            );
            tokio::time::sleep(delay).await;
            match self.backend.enqueue(&event).await {
                Ok(()) => {
                    self.emitted(parent, handler, &event);
                    return Ok(());
                }
                Err(e) => last_error = e,
            }
        }

        Err(Error::Enqueue {
            event_id: event.id(),
            attempts: retries + 1,
            source: Box::new(last_error),
        })
    }

    fn emitted(&self, parent: &Event, handler: &Arc<str>, event: &Event) {
        self.stats.update(|s| s.events_emitted += 1);
        self.observe(
            DispatchRecord::new(Stage::Enqueued, event)
                .with_parent(parent)
                .with_handler(handler),
        );
    }

    /// Store a dead letter. Returns false if the store failed; the failure is
    /// logged and the loop goes on.
    async fn dead_letter(&mut self, letter: DeadLetter) -> bool {
        let event = letter.event.clone();
        let reason = letter.reason.clone();
        match self.dead_letters.store(letter).await {
            Ok(()) => {
                self.stats.update(|s| s.dead_lettered += 1);
                self.observe(DispatchRecord::new(Stage::DeadLettered, &event).with_detail(reason));
                true
            }
            Err(e) => {
                error!(event_id = %event.id(), event_type = event.event_type(), reason, error = %e, "failed to store dead letter");
                false
            }
        }
    }

    async fn ack(&mut self, event: &Event) {
        match self.backend.ack(event).await {
            Ok(()) => self.observe(DispatchRecord::new(Stage::Acked, event)),
            Err(e) => {
                self.stats.update(|s| s.ack_errors += 1);
                self.observe(DispatchRecord::new(Stage::AckFailed, event).with_detail(e.to_string()));
            }
        }
    }

    fn observe(&self, record: DispatchRecord) {
        record.trace();
        for monitor in &self.monitors {
            monitor.on_record(&record);
        }
    }
}

/// Builds a [`Spine`] in one expression.
///
/// Registration errors are kept until [`build`](Self::build), which
/// reports the first one.
///
/// ```rust
/// use eventspine::{handler_fn, Config, Emit, HandlerFailureMode, MemoryBackend, MemoryDeadLetters, Spine};
///
/// let dead_letters = MemoryDeadLetters::bounded(100);
/// let spine = Spine::builder(MemoryBackend::new())
///     .config(Config::default().with_handler_failure_mode(HandlerFailureMode::Store))
///     .dead_letters(dead_letters.clone())
///     .handler(handler_fn("audit", "ORDER_PLACED", |_| Ok(Emit::none())))
///     .build()
///     .unwrap();
/// assert_eq!(spine.handler_names().collect::<Vec<_>>(), ["audit"]);
/// ```
pub struct SpineBuilder<B: Backend, S: DeadLetterStore = MemoryDeadLetters> {
    backend: B,
    dead_letters: S,
    config: Config,
    routes: Vec<Route>,
    monitors: Vec<Box<dyn Monitor>>,
    error: Option<Error>,
}

impl<B: Backend> SpineBuilder<B> {
    fn new(backend: B) -> Self {
        SpineBuilder {
            backend,
            dead_letters: MemoryDeadLetters::new(),
            config: Config::default(),
            routes: Vec::new(),
            monitors: Vec::new(),
            error: None,
        }
    }
}

impl<B: Backend, S: DeadLetterStore> SpineBuilder<B, S> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        if self.error.is_none() {
            match Route::new(handler) {
                Ok(route) => self.routes.push(route),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    pub fn dead_letters<S2: DeadLetterStore>(self, dead_letters: S2) -> SpineBuilder<B, S2> {
        SpineBuilder {
            backend: self.backend,
            dead_letters,
            config: self.config,
            routes: self.routes,
            monitors: self.monitors,
            error: self.error,
        }
    }

    pub fn monitor<M: Monitor + 'static>(mut self, monitor: M) -> Self {
        self.monitors.push(Box::new(monitor));
        self
    }

    pub fn build(mut self) -> Result<Spine<B, S>> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self.into_spine()),
        }
    }

    fn into_spine(self) -> Spine<B, S> {
        Spine {
            routes: self.routes,
            backend: self.backend,
            dead_letters: self.dead_letters,
            config: self.config,
            stats: Arc::default(),
            cancel_token: CancellationToken::new(),
            monitors: self.monitors,
        }
    }
}

/// Cloneable remote control of a [`Spine`].
#[derive(Clone)]
pub struct SpineHandle {
    cancel_token: CancellationToken,
    stats: Arc<SharedStats>,
}

impl SpineHandle {
    /// Ask the Spine to exit after the event it is processing.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Statistics of the current or last run.
    pub fn stats(&self) -> SpineStats {
        self.stats.snapshot()
    }

    /// Enqueue failures for one event type, or in total.
    pub fn enqueue_failure_count(&self, event_type: Option<&str>) -> u64 {
        self.stats.snapshot().enqueue_failure_count(event_type)
    }
}
