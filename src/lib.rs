//! eventspine - an event dispatcher over pluggable queues
//!
//! Handlers subscribe to event types. A [`Spine`] pulls events from a
//! [`Backend`], calls every subscribed handler in registration order, and
//! feeds the events they emit back into the backend until the queue drains.
//! Failures are absorbed by configurable policies and end up in a
//! dead-letter store rather than crashing the loop.
//!
//! Two backends ship with the crate: [`MemoryBackend`] for in-process
//! pipelines and [`StreamBackend`] for durable, at-least-once delivery over
//! Redis Streams consumer groups.
//!
//! See `demos/hello_world.rs`, `demos/etl.rs` and `demos/notifications.rs`.

mod config;
mod dead_letter;
mod emit;
mod error;
mod event;
mod failure_mode;
mod handler;
mod spine;
mod stats;
mod subscribe;

mod internal;

pub mod backend;
pub mod monitoring;

pub use backend::{Backend, Health, MemoryBackend, StreamBackend, StreamConfig};
pub use config::Config;
pub use dead_letter::{DeadLetter, DeadLetterStore, MemoryDeadLetters};
pub use emit::Emit;
pub use error::Error;
pub use event::{Event, EventBuilder, MAX_PAYLOAD_SIZE, Payload};
pub use failure_mode::{EnqueueFailureMode, HandlerFailureMode};
pub use handler::{FnHandler, Handler, handler_fn};
pub use spine::{Spine, SpineBuilder, SpineHandle};
pub use stats::SpineStats;
pub use subscribe::Subscribe;

pub type Result<T = ()> = std::result::Result<T, Error>;
