use std::{sync::Arc, time::Duration};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid event: {0}")]
    Validation(Arc<str>),

    #[error("Invalid handler registration: {0}")]
    Registration(Arc<str>),

    #[error("Handler error: {0}")]
    Handler(Arc<str>),

    #[error("Handler exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(Arc<str>),

    #[error("Backend transport error: {0}")]
    Transport(Arc<str>),

    #[error("Queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Failed to enqueue event {event_id} after {attempts} attempt(s): {source}")]
    Enqueue {
        event_id: Uuid,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Step budget of {0} exceeded")]
    StepBudgetExceeded(u64),

    #[error("Backend unavailable after {failures} consecutive failures (last error: {last_error})")]
    BackendUnavailable { failures: u32, last_error: Arc<str> },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Error to return from [`Handler::process`](crate::Handler::process).
    pub fn handler(reason: impl Into<Arc<str>>) -> Self {
        Error::Handler(reason.into())
    }

    pub(crate) fn validation(reason: impl Into<Arc<str>>) -> Self {
        Error::Validation(reason.into())
    }

    pub(crate) fn registration(reason: impl Into<Arc<str>>) -> Self {
        Error::Registration(reason.into())
    }

    pub(crate) fn backend(reason: impl Into<Arc<str>>) -> Self {
        Error::Backend(reason.into())
    }

    pub(crate) fn transport(reason: impl Into<Arc<str>>) -> Self {
        Error::Transport(reason.into())
    }

    /// Connection-level failure that a reconnect may cure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Errors that abort a [`Spine`](crate::Spine) run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Enqueue { .. } | Error::StepBudgetExceeded(_) | Error::BackendUnavailable { .. }
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            Error::transport(e.to_string())
        } else {
            Error::backend(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::transport("connection reset").is_transport());
        assert!(!Error::backend("WRONGTYPE").is_transport());
        assert!(!Error::QueueFull(4).is_transport());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::StepBudgetExceeded(10).is_fatal());
        assert!(
            Error::Enqueue {
                event_id: Uuid::new_v4(),
                attempts: 1,
                source: Box::new(Error::QueueFull(1)),
            }
            .is_fatal()
        );
        assert!(!Error::handler("boom").is_fatal());
        assert!(!Error::Timeout(Duration::from_millis(5)).is_fatal());
    }

    #[test]
    fn test_enqueue_error_keeps_source() {
        let err = Error::Enqueue {
            event_id: Uuid::nil(),
            attempts: 4,
            source: Box::new(Error::transport("refused")),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Backend transport error: refused"));
        assert!(err.to_string().contains("after 4 attempt(s)"));
    }
}
