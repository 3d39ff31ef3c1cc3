use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Largest accepted payload, measured in bytes of its JSON encoding.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Payload of an [`Event`]: string keys to arbitrary JSON values.
pub type Payload = Map<String, Value>;

/// An immutable record of something that happened.
///
/// Events carry four fields and nothing else:
/// - `id`: a v4 UUID, generated unless supplied
/// - `timestamp`: UTC creation time, generated unless supplied
/// - `event_type`: the routing key handlers subscribe to (trimmed, never blank)
/// - `payload`: a JSON object
///
/// Cloning is cheap: clones share the same underlying data, and nothing
/// can mutate it once constructed.
///
/// # Examples
///
/// ```rust
/// use eventspine::Event;
/// use serde_json::json;
///
/// let event = Event::new("HELLO", json!({ "name": "World" })).unwrap();
/// assert_eq!(event.event_type(), "HELLO");
///
/// let restored = Event::from_json(&event.to_json().unwrap()).unwrap();
/// assert_eq!(restored, event);
/// ```
#[derive(Clone, PartialEq)]
pub struct Event(Arc<EventData>);

#[derive(Debug, PartialEq)]
struct EventData {
    id: Uuid,
    timestamp: DateTime<Utc>,
    event_type: String,
    payload: Payload,
}

impl Event {
    /// Create an event with a generated id and timestamp.
    ///
    /// `payload` must be a JSON object (or `null`, meaning empty).
    pub fn new(event_type: impl Into<String>, payload: Value) -> Result<Self> {
        Self::builder(event_type).payload(payload).build()
    }

    pub fn builder(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder {
            event_type: event_type.into(),
            payload: Value::Null,
            id: None,
            timestamp: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0.timestamp
    }

    pub fn event_type(&self) -> &str {
        &self.0.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    /// Shorthand for `payload().get(key)`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.payload.get(key)
    }

    /// Canonical serialized form: a JSON object with exactly the four event fields.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the canonical form. Any malformed input is a validation error.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::validation(e.to_string()))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.0.id)
            .field("timestamp", &self.0.timestamp)
            .field("event_type", &self.0.event_type)
            .field("payload", &self.0.payload)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.event_type, self.0.id)
    }
}

/// Builder for events with an explicit id or timestamp.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    payload: Value,
    id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventBuilder {
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validate and construct the event.
    pub fn build(self) -> Result<Event> {
        let event_type = self.event_type.trim();
        if event_type.is_empty() {
            return Err(Error::validation("event_type must not be empty"));
        }

        let payload = match self.payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::validation(format!(
                    "payload must be a JSON object, got {}",
                    kind_of(&other)
                )));
            }
        };

        let size = serde_json::to_vec(&payload)?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::validation(format!(
                "payload of {size} bytes exceeds maximum size of {MAX_PAYLOAD_SIZE} bytes"
            )));
        }

        let id = match self.id {
            Some(id) if id.get_version_num() != 4 => {
                return Err(Error::validation(format!("id {id} is not a v4 UUID")));
            }
            Some(id) => id,
            None => Uuid::new_v4(),
        };

        Ok(Event(Arc::new(EventData {
            id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event_type: event_type.to_owned(),
            payload,
        })))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Serialize)]
struct EventRef<'a> {
    id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a str,
    payload: &'a Payload,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EventRepr {
    id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
    event_type: String,
    #[serde(default)]
    payload: Value,
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        EventRef {
            id: &self.0.id,
            timestamp: &self.0.timestamp,
            event_type: &self.0.event_type,
            payload: &self.0.payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = EventRepr::deserialize(deserializer)?;
        let mut builder = Event::builder(repr.event_type).payload(repr.payload);
        if let Some(id) = repr.id {
            builder = builder.id(id);
        }
        if let Some(timestamp) = repr.timestamp {
            builder = builder.timestamp(timestamp);
        }
        builder.build().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generates_id_and_timestamp() {
        let before = Utc::now();
        let event = Event::new("TEST", json!({})).unwrap();
        assert_eq!(event.id().get_version_num(), 4);
        assert!(event.timestamp() >= before);
        assert!(event.payload().is_empty());
    }

    #[test]
    fn test_event_type_is_trimmed() {
        let event = Event::new("  ORDER_PLACED \n", Value::Null).unwrap();
        assert_eq!(event.event_type(), "ORDER_PLACED");
    }

    #[test]
    fn test_blank_event_type_rejected() {
        for blank in ["", " ", "   \t\n  ", "\r\n"] {
            let err = Event::new(blank, json!({})).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{blank:?} accepted");
        }
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = Event::new("TEST", json!([1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("an array"));
        assert!(Event::new("TEST", json!("text")).is_err());
    }

    #[test]
    fn test_payload_size_limit_counts_bytes() {
        let at_limit = "x".repeat(MAX_PAYLOAD_SIZE - 10);
        assert!(Event::new("TEST", json!({ "k": at_limit })).is_ok());

        let over = "x".repeat(MAX_PAYLOAD_SIZE);
        let err = Event::new("TEST", json!({ "data": over })).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum size"));

        let emoji = "\u{1F525}".repeat(MAX_PAYLOAD_SIZE / 4 + 1);
        assert!(Event::new("TEST", json!({ "emoji": emoji })).is_err());
    }

    #[test]
    fn test_supplied_id_must_be_v4() {
        let v1 = Uuid::parse_str("550e8400-e29b-11d4-a716-446655440000").unwrap();
        assert!(Event::builder("TEST").id(v1).build().is_err());

        let v4 = Uuid::new_v4();
        let event = Event::builder("TEST").id(v4).build().unwrap();
        assert_eq!(event.id(), v4);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let event = Event::new(
            "ORDER",
            json!({
                "qty": 3,
                "price": 19.25,
                "tags": ["a", "b"],
                "nested": { "deep": { "ok": true } },
                "none": null
            }),
        )
        .unwrap();
        let restored = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(restored, event);
        assert_eq!(restored.id(), event.id());
        assert_eq!(restored.timestamp(), event.timestamp());
    }

    #[test]
    fn test_wire_form_has_exactly_four_fields() {
        let event = Event::new("TEST", json!({ "a": 1 })).unwrap();
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["event_type", "id", "payload", "timestamp"]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{"event_type":"TEST","payload":{},"priority":5}"#;
        let err = Event::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_malformed_input_rejected() {
        for input in [
            "",
            "not json",
            "[]",
            r#"{"payload":{}}"#,
            r#"{"event_type":"  ","payload":{}}"#,
            r#"{"event_type":"T","payload":[1]}"#,
            r#"{"id":"not-a-uuid","event_type":"T"}"#,
        ] {
            assert!(
                matches!(Event::from_json(input), Err(Error::Validation(_))),
                "{input:?} accepted"
            );
        }
    }

    #[test]
    fn test_missing_id_and_timestamp_are_generated() {
        let event = Event::from_json(r#"{"event_type":"TEST"}"#).unwrap();
        assert_eq!(event.id().get_version_num(), 4);
        assert!(event.payload().is_empty());
    }

    #[test]
    fn test_clones_share_data() {
        let event = Event::new("TEST", json!({ "k": "v" })).unwrap();
        let clone = event.clone();
        assert!(Arc::ptr_eq(&event.0, &clone.0));
        assert_eq!(clone.get("k"), Some(&json!("v")));
    }
}
