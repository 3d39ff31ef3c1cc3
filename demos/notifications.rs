//! Notification fan-out over the durable stream backend.
//!
//! `NOTIFICATION_REQUESTED` is validated, routed to one delivery event per
//! channel, delivered, and audited. Deliveries that fail end up in the
//! dead-letter stream.
//!
//! Uses Redis when `SPINE_REDIS_URL` is set, an in-process stream server
//! otherwise:
//!
//! ```sh
//! SPINE_REDIS_URL=redis://127.0.0.1:6379 cargo run --example notifications
//! ```

use std::{sync::Arc, time::Duration};

use eventspine::{
    backend::{MemoryStreams, StreamClient},
    *,
};
use serde_json::{Value, json};

const CHANNELS: [&str; 3] = ["email", "sms", "push"];
const PRIORITIES: [&str; 4] = ["low", "normal", "high", "critical"];
const BLOCKED_NUMBERS: [&str; 2] = ["+1555000000", "+1555000001"];

struct Contact {
    email: &'static str,
    phone: &'static str,
    device_token: &'static str,
}

fn contact(user_id: &str) -> Option<Contact> {
    let (email, phone, device_token) = match user_id {
        "user_001" => ("alice@example.com", "+1555123001", "fcm_token_alice"),
        "user_002" => ("bob@example.com", "+1555123002", "fcm_token_bob"),
        "user_003" => ("charlie@example.com", "+1555000000", "fcm_token_charlie"),
        _ => return None,
    };
    Some(Contact {
        email,
        phone,
        device_token,
    })
}

fn text<'a>(event: &'a Event, key: &str) -> &'a str {
    event.get(key).and_then(Value::as_str).unwrap_or_default()
}

struct Validate;

impl Handler for Validate {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("NOTIFICATION_REQUESTED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let mut errors = Vec::new();
        if text(event, "user_id").trim().is_empty() {
            errors.push("user_id is required".to_owned());
        }
        let channels: Vec<&str> = event
            .get("channels")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if channels.is_empty() {
            errors.push("at least one channel is required".to_owned());
        }
        for unknown in channels.iter().filter(|c| !CHANNELS.contains(*c)) {
            errors.push(format!("invalid channel: {unknown}"));
        }
        if text(event, "message").trim().is_empty() {
            errors.push("message is required".to_owned());
        }
        let priority = event.get("priority").and_then(Value::as_str).unwrap_or("normal");
        if !PRIORITIES.contains(&priority) {
            errors.push(format!("invalid priority: {priority}"));
        }

        let emitted = if errors.is_empty() {
            Event::new(
                "NOTIFICATION_VALIDATED",
                json!({
                    "user_id": text(event, "user_id").trim(),
                    "channels": channels,
                    "message": text(event, "message").trim(),
                    "priority": priority,
                }),
            )?
        } else {
            Event::new(
                "NOTIFICATION_FAILED",
                json!({ "user_id": text(event, "user_id"), "errors": errors }),
            )?
        };
        Ok(emitted.into())
    }
}

struct Router;

impl Handler for Router {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("NOTIFICATION_VALIDATED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let user_id = text(event, "user_id");
        let Some(contact) = contact(user_id) else {
            return Err(Error::handler(format!("no contact details for {user_id}")));
        };
        let message = text(event, "message");
        let priority = text(event, "priority");

        let channels = event.get("channels").and_then(Value::as_array);
        let mut emitted = Vec::new();
        for channel in channels.into_iter().flatten().filter_map(Value::as_str) {
            let (event_type, payload) = match channel {
                "email" => (
                    "EMAIL_SEND_REQUESTED",
                    json!({
                        "user_id": user_id,
                        "email": contact.email,
                        "subject": format!("[{}] Notification", priority.to_uppercase()),
                        "body": message,
                    }),
                ),
                "sms" => (
                    "SMS_SEND_REQUESTED",
                    json!({
                        "user_id": user_id,
                        "phone": contact.phone,
                        "message": message.chars().take(160).collect::<String>(),
                    }),
                ),
                "push" => (
                    "PUSH_SEND_REQUESTED",
                    json!({
                        "user_id": user_id,
                        "device_token": contact.device_token,
                        "body": message.chars().take(256).collect::<String>(),
                    }),
                ),
                _ => continue,
            };
            emitted.push(Event::new(event_type, payload)?);
        }
        Ok(emitted.into())
    }
}

/// Delivers over one channel, simulating gateway latency.
struct Sender {
    channel: &'static str,
    latency: Duration,
}

impl Handler for Sender {
    fn subscriptions(&self) -> Subscribe {
        match self.channel {
            "email" => Subscribe::from("EMAIL_SEND_REQUESTED"),
            "sms" => Subscribe::from("SMS_SEND_REQUESTED"),
            _ => Subscribe::from("PUSH_SEND_REQUESTED"),
        }
    }

    fn name(&self) -> std::borrow::Cow<'static, str> {
        format!("{}-sender", self.channel).into()
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        tokio::time::sleep(self.latency).await;
        if BLOCKED_NUMBERS.contains(&text(event, "phone")) {
            return Err(Error::handler("recipient is blocked"));
        }
        Ok(Event::new(
            "DELIVERED",
            json!({ "user_id": text(event, "user_id"), "channel": self.channel }),
        )?
        .into())
    }
}

#[derive(Default)]
struct Audit {
    delivered: u32,
    rejected: u32,
}

impl Handler for Audit {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from(["DELIVERED", "NOTIFICATION_FAILED"])
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        if event.event_type() == "DELIVERED" {
            self.delivered += 1;
            println!("  delivered {} to {}", text(event, "channel"), text(event, "user_id"));
        } else {
            self.rejected += 1;
            println!("  rejected request: {}", event.get("errors").unwrap_or(&Value::Null));
        }
        println!("  audit: {} delivered, {} rejected", self.delivered, self.rejected);
        Ok(Emit::none())
    }
}

fn requests() -> Result<Vec<Event>> {
    [
        json!({ "user_id": "user_001", "channels": ["email", "sms", "push"], "message": "Order #48213 shipped!", "priority": "high" }),
        json!({ "user_id": "user_002", "channels": ["email"], "message": "Weekly digest: 7 updates", "priority": "low" }),
        json!({ "user_id": "user_003", "channels": ["sms", "push"], "message": "Security alert", "priority": "critical" }),
        json!({ "user_id": "user_001", "channels": ["email"], "message": "", "priority": "normal" }),
        json!({ "user_id": "user_002", "channels": ["telegram"], "message": "Test", "priority": "normal" }),
    ]
    .into_iter()
    .map(|payload| Event::new("NOTIFICATION_REQUESTED", payload))
    .collect()
}

async fn run_pipeline<C: StreamClient>(backend: Arc<StreamBackend<C>>) -> Result<()> {
    for request in requests()? {
        backend.enqueue(&request).await?;
    }

    let config = Config::default()
        .with_handler_failure_mode(HandlerFailureMode::Store)
        .with_handler_timeout(Duration::from_secs(2))
        .with_pull_timeout(Duration::from_millis(300));
    let mut spine = Spine::builder(backend.clone())
        .config(config)
        .dead_letters(backend.clone())
        .handler(Validate)
        .handler(Router)
        .handler(Sender { channel: "email", latency: Duration::from_millis(20) })
        .handler(Sender { channel: "sms", latency: Duration::from_millis(30) })
        .handler(Sender { channel: "push", latency: Duration::from_millis(10) })
        .handler(Audit::default())
        .build()?;

    let stats = spine.run(None).await?;

    println!("\nevents processed: {}", stats.events_processed);
    println!("events emitted:   {}", stats.events_emitted);
    println!("dead-lettered:    {}", stats.dead_lettered);
    for record in backend.dead_letters(20).await? {
        println!("  {} - {}", record.event.event_type(), record.reason);
    }

    let health = backend.health().await;
    println!("\nbackend health: {}", serde_json::to_string_pretty(&health)?);
    backend.close().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = StreamConfig::from_env()
        .with_stream(format!("notifications:{}", uuid::Uuid::new_v4().simple()))
        .with_group("notifiers");

    if std::env::var("SPINE_REDIS_URL").is_ok() {
        run_pipeline(Arc::new(StreamBackend::connect(config).await?)).await
    } else {
        run_pipeline(Arc::new(StreamBackend::new(MemoryStreams::new(), config))).await
    }
}
