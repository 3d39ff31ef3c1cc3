use eventspine::*;
use serde_json::{Value, json};

// Answers HELLO with GREETED
struct Greeter;

impl Handler for Greeter {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("HELLO")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let name = event.get("name").and_then(Value::as_str).unwrap_or("stranger");
        Ok(Event::new("GREETED", json!({ "msg": format!("Hello, {name}!") }))?.into())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut spine = Spine::builder(MemoryBackend::new())
        .handler(Greeter)
        // Closures work too for synchronous handlers
        .handler(handler_fn("printer", "GREETED", |event| {
            println!("{}", event.get("msg").and_then(Value::as_str).unwrap_or_default());
            Ok(Emit::none())
        }))
        .build()?;

    // Runs until the queue drains
    let stats = spine.run(Some(Event::new("HELLO", json!({ "name": "World" }))?)).await?;
    println!("{} events processed", stats.events_processed);
    Ok(())
}
