use std::fmt;

/// What the [`Spine`](crate::Spine) does when enqueuing an emitted event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EnqueueFailureMode {
    /// Abort the run immediately.
    Fail,
    /// Retry with exponential backoff, then abort.
    Retry,
    /// Write the event to the dead-letter store and keep going.
    #[default]
    Store,
}

impl EnqueueFailureMode {
    pub fn is_fail(&self) -> bool {
        matches!(self, EnqueueFailureMode::Fail)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, EnqueueFailureMode::Retry)
    }

    pub fn is_store(&self) -> bool {
        matches!(self, EnqueueFailureMode::Store)
    }
}

impl fmt::Display for EnqueueFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueFailureMode::Fail => write!(f, "fail"),
            EnqueueFailureMode::Retry => write!(f, "retry"),
            EnqueueFailureMode::Store => write!(f, "store"),
        }
    }
}

/// What the [`Spine`](crate::Spine) does when a handler returns an error or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandlerFailureMode {
    /// Log the failure and acknowledge the event.
    #[default]
    Log,
    /// Dead-letter the event and acknowledge it.
    Store,
    /// Leave the event unacknowledged for the backend to redeliver.
    ///
    /// Backends without redelivery treat this as [`HandlerFailureMode::Log`].
    Nack,
}

impl HandlerFailureMode {
    pub fn is_log(&self) -> bool {
        matches!(self, HandlerFailureMode::Log)
    }

    pub fn is_store(&self) -> bool {
        matches!(self, HandlerFailureMode::Store)
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, HandlerFailureMode::Nack)
    }
}

impl fmt::Display for HandlerFailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFailureMode::Log => write!(f, "log"),
            HandlerFailureMode::Store => write!(f, "store"),
            HandlerFailureMode::Nack => write!(f, "nack"),
        }
    }
}
