//! Dispatch loop behavior over the in-memory backend.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{Broken, Greeter, Inbox, Relay, event, init_tracing};
use eventspine::{
    Config, Emit, Error, Event, Handler, HandlerFailureMode, MemoryBackend, Result, Spine,
    Subscribe, handler_fn,
    monitoring::{RecordLog, Recorder, Stage},
};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_hello_greeted() {
    init_tracing();
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Greeter)
        .handler(Inbox(inbox.clone()))
        .build()
        .unwrap();

    let seed = Event::new("HELLO", json!({ "name": "Ada" })).unwrap();
    let stats = spine.run(Some(seed)).await.unwrap();

    assert_eq!(stats.dispatches, 2);
    assert_eq!(stats.events_processed, 2);
    assert_eq!(stats.events_emitted, 1);
    assert!(spine.dead_letters().is_empty());
    assert!(spine.backend().is_empty());
    assert_eq!(*inbox.lock().unwrap(), ["Hello, Ada!"]);
}

#[tokio::test(start_paused = true)]
async fn test_failing_handler_is_dead_lettered() {
    let config = Config::default().with_handler_failure_mode(HandlerFailureMode::Store);
    let mut spine = Spine::builder(MemoryBackend::new())
        .config(config)
        .handler(Broken("INGEST"))
        .build()
        .unwrap();

    let seed = event("INGEST");
    let stats = spine.run(Some(seed.clone())).await.unwrap();

    let dead = spine.dead_letters().records();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event, seed);
    assert_eq!(dead[0].reason, "handler 'Broken' failed: Handler error: parse error");
    assert_eq!(stats.handler_error_count("Broken"), 1);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_log_mode_keeps_going() {
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Broken("A"))
        .handler(Relay { from: "A", to: "B" })
        .handler(Broken("B"))
        .build()
        .unwrap();

    let stats = spine.run(Some(event("A"))).await.unwrap();

    assert_eq!(stats.events_processed, 2);
    assert_eq!(stats.handler_error_count("Broken"), 2);
    assert!(spine.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_step_budget_aborts_endless_loop() {
    let config = Config::default().with_max_steps(2);
    let mut spine = Spine::builder(MemoryBackend::new())
        .config(config)
        .handler(Relay { from: "LOOP", to: "LOOP" })
        .build()
        .unwrap();
    let handle = spine.handle();

    let err = spine.run(Some(event("LOOP"))).await.unwrap_err();

    assert!(matches!(err, Error::StepBudgetExceeded(2)));
    let stats = handle.stats();
    assert_eq!(stats.events_processed, 2);
    assert_eq!(stats.dispatches, 2);
    assert_eq!(spine.backend().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_routing_follows_registration_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str, subscribe: &'static str| {
        let calls = calls.clone();
        handler_fn(name, subscribe, move |_| {
            calls.lock().unwrap().push(name);
            Ok(Emit::none())
        })
    };
    let log = RecordLog::new();

    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(recorder("third", "ORDER"))
        .handler(recorder("other", "REFUND"))
        .handler(recorder("first", "ORDER"))
        .handler(recorder("second", "ORDER"))
        .monitor(log.clone())
        .build()
        .unwrap();

    spine.run(Some(event("ORDER"))).await.unwrap();

    assert_eq!(*calls.lock().unwrap(), ["third", "first", "second"]);
    assert_eq!(log.dispatch_order(), ["third", "first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_event_is_acked() {
    let log = RecordLog::new();
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Greeter)
        .monitor(log.clone())
        .build()
        .unwrap();

    let stats = spine.run(Some(event("UNKNOWN"))).await.unwrap();

    assert_eq!(stats.events_processed, 1);
    assert_eq!(stats.dispatches, 0);
    assert_eq!(log.count(Stage::Acked), 1);
}

struct Sleeper;

impl Handler for Sleeper {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("SLOW")
    }

    async fn process(&mut self, _event: &Event) -> Result<Emit> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Event::new("DONE", serde_json::Value::Null)?.into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_a_handler_failure() {
    let config = Config::default()
        .with_handler_timeout(Duration::from_millis(100))
        .with_handler_failure_mode(HandlerFailureMode::Store);
    let mut spine = Spine::builder(MemoryBackend::new())
        .config(config)
        .handler(Sleeper)
        .build()
        .unwrap();

    let stats = spine.run(Some(event("SLOW"))).await.unwrap();

    assert_eq!(stats.handler_error_count("Sleeper"), 1);
    assert_eq!(stats.events_emitted, 0);
    let dead = spine.dead_letters().records();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("100ms"));
}

#[tokio::test(start_paused = true)]
async fn test_nack_without_redelivery_acks() {
    let log = RecordLog::new();
    let config = Config::default().with_handler_failure_mode(HandlerFailureMode::Nack);
    let mut spine = Spine::builder(MemoryBackend::new())
        .config(config)
        .handler(Broken("A"))
        .monitor(log.clone())
        .build()
        .unwrap();

    let stats = spine.run(Some(event("A"))).await.unwrap();

    assert_eq!(stats.handler_error_count("Broken"), 1);
    assert_eq!(log.count(Stage::Acked), 1);
    assert_eq!(log.count(Stage::Unacked), 0);
    assert!(spine.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_exits_before_next_pull() {
    let mut spine = Spine::new(MemoryBackend::new());
    let handle = spine.handle();
    spine
        .add_handler(handler_fn("stopper", "TICK", move |_| {
            handle.stop();
            Ok(Event::new("TICK", serde_json::Value::Null)?.into())
        }))
        .unwrap();

    let stats = spine.run(Some(event("TICK"))).await.unwrap();

    assert_eq!(stats.events_processed, 1);
    assert_eq!(spine.backend().len(), 1);

    let again = spine.run(None).await.unwrap();
    assert_eq!(again.events_processed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_from_another_task() {
    let backend = Arc::new(MemoryBackend::new());
    let mut spine = Spine::new(backend.clone());
    spine.add_handler(Relay { from: "TICK", to: "TICK" }).unwrap();
    let handle = spine.handle();

    let task = tokio::spawn(async move { spine.run(Some(event("TICK"))).await });
    while handle.stats().events_processed < 3 {
        tokio::task::yield_now().await;
    }
    handle.stop();

    let stats = task.await.unwrap().unwrap();
    assert!(stats.events_processed >= 3);
    assert_eq!(backend.len(), 1);
}

struct Doubler;

impl Handler for Doubler {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("NUMBER")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        tokio::task::yield_now().await;
        let n = event.get("n").and_then(|v| v.as_i64()).unwrap_or_default();
        Ok(Event::new("DOUBLED", json!({ "n": n * 2 }))?.into())
    }
}

#[tokio::test(start_paused = true)]
async fn test_sync_and_async_handlers_mix() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Doubler)
        .handler(handler_fn("sink", "DOUBLED", move |e| {
            sink.lock().unwrap().push(e.get("n").and_then(|v| v.as_i64()));
            Ok(().into())
        }))
        .build()
        .unwrap();

    spine.run(Some(Event::new("NUMBER", json!({ "n": 21 })).unwrap())).await.unwrap();

    assert_eq!(*results.lock().unwrap(), [Some(42)]);
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_preserves_emit_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(handler_fn("split", "BATCH", |_| {
            (1..=3)
                .map(|i| Event::new("ITEM", json!({ "i": i })))
                .collect::<Result<Vec<_>>>()
                .map(Emit::from)
        }))
        .handler(handler_fn("collect", "ITEM", move |e| {
            sink.lock().unwrap().push(e.get("i").and_then(|v| v.as_i64()).unwrap_or_default());
            Ok(Emit::none())
        }))
        .build()
        .unwrap();

    let stats = spine.run(Some(event("BATCH"))).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), [1, 2, 3]);
    assert_eq!(stats.events_emitted, 3);
    assert_eq!(stats.events_processed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_records_correlate_by_event_id() {
    let log = RecordLog::new();
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Greeter)
        .monitor(log.clone())
        .build()
        .unwrap();

    let seed = event("HELLO");
    spine.run(Some(seed.clone())).await.unwrap();

    let stages: Vec<Stage> = log.event(seed.id()).iter().map(|r| r.stage).collect();
    assert_eq!(
        stages,
        [Stage::Seeded, Stage::Pulled, Stage::Dispatched, Stage::Completed, Stage::Acked]
    );

    let greeted = log.stage(Stage::Enqueued);
    assert_eq!(greeted.len(), 1);
    assert_eq!(greeted[0].parent_id, Some(seed.id()));
    assert_eq!(greeted[0].handler.as_deref(), Some("Greeter"));
}

#[tokio::test(start_paused = true)]
async fn test_recorder_captures_run() {
    let path = std::env::temp_dir().join(format!("eventspine-run-{}.jsonl", uuid::Uuid::new_v4()));
    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Greeter)
        .monitor(Recorder::new(&path).unwrap())
        .build()
        .unwrap();

    spine.run(Some(event("HELLO"))).await.unwrap();
    drop(spine);

    let content = std::fs::read_to_string(&path).unwrap();
    let stages: Vec<String> = content
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["stage"].to_string())
        .collect();
    assert!(stages.contains(&"\"dispatched\"".to_owned()));
    assert_eq!(stages.iter().filter(|s| *s == "\"pulled\"").count(), 2);
    let _ = std::fs::remove_file(path);
}

#[tokio::test(start_paused = true)]
async fn test_stats_reset_between_runs() {
    let mut spine = Spine::builder(MemoryBackend::new()).handler(Greeter).build().unwrap();

    let first = spine.run(Some(event("HELLO"))).await.unwrap();
    let second = spine.run(Some(event("HELLO"))).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(spine.stats().events_processed, 2);
}
