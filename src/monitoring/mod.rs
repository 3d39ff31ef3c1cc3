//! Observation of the dispatch loop.
//!
//! The [`Spine`](crate::Spine) turns each step of an event's lifecycle into a
//! [`DispatchRecord`], logs it through `tracing`, and hands it to every
//! registered [`Monitor`].
//!
//! # Available Monitors
//!
//! - [`Recorder`] - writes records to a JSON Lines file or writer
//! - [`RecordLog`] - keeps records in memory for inspection
//!
//! # Example
//!
//! ```ignore
//! use eventspine::monitoring::RecordLog;
//!
//! let log = RecordLog::new();
//! let mut spine = Spine::builder(backend).handler(Greeter).monitor(log.clone()).build()?;
//! spine.run(Some(seed)).await?;
//! assert_eq!(log.count(Stage::Dispatched), 1);
//! ```

mod monitor;
mod record;
mod record_log;
mod recorder;

pub use monitor::Monitor;
pub use record::{DispatchRecord, Stage};
pub use record_log::RecordLog;
pub use recorder::Recorder;
