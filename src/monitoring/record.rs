use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::field::display;
use uuid::Uuid;

use crate::Event;

/// Point in an event's journey through the [`Spine`](crate::Spine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Seeded,
    Pulled,
    Dispatched,
    Completed,
    HandlerFailed,
    Enqueued,
    EnqueueFailed,
    DeadLettered,
    Acked,
    AckFailed,
    /// Left unacknowledged for backend redelivery.
    Unacked,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Seeded => "seed event enqueued",
            Stage::Pulled => "event pulled",
            Stage::Dispatched => "dispatching event to handler",
            Stage::Completed => "handler completed",
            Stage::HandlerFailed => "handler failed",
            Stage::Enqueued => "emitted event enqueued",
            Stage::EnqueueFailed => "failed to enqueue emitted event",
            Stage::DeadLettered => "event dead-lettered",
            Stage::Acked => "event acknowledged",
            Stage::AckFailed => "failed to acknowledge event",
            Stage::Unacked => "event left for redelivery",
        };
        f.write_str(s)
    }
}

/// Structured observation emitted by the Spine.
///
/// Every record names the event it concerns, so all records of one event's
/// lifecycle can be correlated by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub stage: Stage,
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<Arc<str>>,
    /// For emitted events: the event whose handler produced them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<f64>,
    pub at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn new(stage: Stage, event: &Event) -> Self {
        Self {
            stage,
            event_id: event.id(),
            event_type: event.event_type().to_owned(),
            handler: None,
            parent_id: None,
            detail: None,
            elapsed_ms: None,
            at: Utc::now(),
        }
    }

    pub fn with_handler(mut self, handler: &Arc<str>) -> Self {
        self.handler = Some(handler.clone());
        self
    }

    pub fn with_parent(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(elapsed.as_micros() as f64 / 1000.0);
        self
    }

    /// Emit this record through `tracing`.
    pub(crate) fn trace(&self) {
        let event_id = display(self.event_id);
        let event_type = self.event_type.as_str();
        let handler = self.handler.as_deref();
        let parent_id = self.parent_id.map(display);
        let detail = self.detail.as_deref();
        let elapsed_ms = self.elapsed_ms;

        match self.stage {
            Stage::HandlerFailed | Stage::EnqueueFailed | Stage::AckFailed => {
                tracing::error!(event_id, event_type, handler, parent_id, detail, "{}", self.stage)
            }
            Stage::DeadLettered | Stage::Unacked => {
                tracing::warn!(event_id, event_type, handler, parent_id, detail, "{}", self.stage)
            }
            Stage::Enqueued | Stage::Acked => {
                tracing::debug!(event_id, event_type, parent_id, detail, "{}", self.stage)
            }
            _ => tracing::info!(event_id, event_type, handler, detail, elapsed_ms, "{}", self.stage),
        }
    }
}
