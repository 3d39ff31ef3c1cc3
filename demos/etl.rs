//! A four stage ETL pipeline:
//!
//! `ETL_START -> RAW_DATA_LOADED -> DATA_CLEANED -> DATA_TRANSFORMED -> summary`
//!
//! Run with `RUST_LOG=eventspine=debug` to see the dispatch trace as JSON.

use std::collections::BTreeMap;

use eventspine::{monitoring::Recorder, *};
use serde_json::{Map, Value, json};

const SAMPLE: &str = "\
name,age,salary,department
Alice,30,75000,Engineering
Bob,25,55000,Marketing
Charlie,35,85000,Engineering
Diana,28,62000,Sales
Eve,32,78000,Engineering
Frank,,45000,Marketing
Grace,29,67000,Sales
Henry,40,95000,Engineering
Ivy,27,58000,Marketing
Jack,33,72000,Sales
";

fn records(event: &Event) -> Vec<Map<String, Value>> {
    event
        .get("records")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
        .unwrap_or_default()
}

fn source(event: &Event) -> Value {
    event.get("source_name").cloned().unwrap_or(Value::Null)
}

struct ExtractCsv;

impl Handler for ExtractCsv {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("ETL_START")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let csv = event
            .get("csv_data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::handler("ETL_START without csv_data"))?;

        let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
        let headers: Vec<&str> = lines
            .next()
            .ok_or_else(|| Error::handler("empty csv"))?
            .split(',')
            .map(str::trim)
            .collect();
        let rows: Vec<Value> = lines
            .map(|line| {
                let row: Map<String, Value> = headers
                    .iter()
                    .zip(line.split(',').map(str::trim))
                    .map(|(h, v)| (h.to_string(), Value::from(v)))
                    .collect();
                Value::Object(row)
            })
            .collect();

        Ok(Event::new(
            "RAW_DATA_LOADED",
            json!({ "source_name": source(event), "headers": headers, "records": rows }),
        )?
        .into())
    }
}

struct CleanData;

impl Handler for CleanData {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("RAW_DATA_LOADED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let raw = records(event);
        let total = raw.len();
        let cleaned: Vec<Map<String, Value>> = raw
            .into_iter()
            .filter(|r| r.values().all(|v| v.as_str().is_some_and(|s| !s.is_empty())))
            .map(|r| {
                r.into_iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k, s.trim().to_lowercase().into()),
                        other => (k, other),
                    })
                    .collect()
            })
            .collect();

        Ok(Event::new(
            "DATA_CLEANED",
            json!({
                "source_name": source(event),
                "headers": event.get("headers"),
                "removed_count": total - cleaned.len(),
                "records": cleaned,
            }),
        )?
        .into())
    }
}

struct TransformData;

impl Handler for TransformData {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("DATA_CLEANED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        let rows = records(event);
        let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in &rows {
            for (key, value) in row {
                if let Some(n) = value.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    columns.entry(key.clone()).or_default().push(n);
                }
            }
        }

        let numeric_stats: Map<String, Value> = columns
            .into_iter()
            .map(|(column, values)| {
                let sum: f64 = values.iter().sum();
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let avg = sum / values.len() as f64;
                (column, json!({ "min": min, "max": max, "avg": avg, "sum": sum }))
            })
            .collect();

        Ok(Event::new(
            "DATA_TRANSFORMED",
            json!({
                "source_name": source(event),
                "headers": event.get("headers"),
                "row_count": rows.len(),
                "numeric_stats": numeric_stats,
            }),
        )?
        .into())
    }
}

struct ExportSummary;

impl Handler for ExportSummary {
    fn subscriptions(&self) -> Subscribe {
        Subscribe::from("DATA_TRANSFORMED")
    }

    async fn process(&mut self, event: &Event) -> Result<Emit> {
        println!("=== ETL summary for {} ===", source(event));
        println!("rows: {}", event.get("row_count").unwrap_or(&Value::Null));

        let stats = event.get("numeric_stats").and_then(Value::as_object);
        for (column, s) in stats.into_iter().flatten() {
            let field = |k: &str| s.get(k).and_then(Value::as_f64).unwrap_or_default();
            println!(
                "  {column}: min={:.2} max={:.2} avg={:.2} sum={:.2}",
                field("min"),
                field("max"),
                field("avg"),
                field("sum")
            );
        }
        Ok(Emit::none())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Every dispatch stage is appended to etl_trace.jsonl
    let recorder = Recorder::new("etl_trace.jsonl")?;

    let mut spine = Spine::builder(MemoryBackend::new())
        .config(Config::default().with_handler_failure_mode(HandlerFailureMode::Store))
        .handler(ExtractCsv)
        .handler(CleanData)
        .handler(TransformData)
        .handler(ExportSummary)
        .monitor(recorder)
        .build()?;

    let start = Event::new(
        "ETL_START",
        json!({ "csv_data": SAMPLE, "source_name": "employees.csv" }),
    )?;
    let stats = spine.run(Some(start)).await?;

    println!("\n{} events processed, {} emitted", stats.events_processed, stats.events_emitted);
    for dead in spine.dead_letters().records() {
        println!("dead letter: {} ({})", dead.event, dead.reason);
    }
    Ok(())
}
