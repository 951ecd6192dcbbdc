//! Dual-destination structured logging
//!
//! Every entry is mirrored to stdout via `tracing` and to the
//! `system_logs` table. The table sink is asynchronous and buffered: a
//! worker task drains a bounded queue, inserting batches of up to
//! `batch_size` entries or whatever accumulated within `batch_interval`,
//! whichever comes first. Synchronous callers (exceptions, fatal startup
//! failures) bypass the buffer. Queue overflow also inserts synchronously
//! so entries are never dropped.

mod entry;
mod logger;
mod sink;

pub use entry::{LogEntry, LogLevel};
pub use logger::{SystemLogger, SystemLoggerConfig};
pub use sink::{LogSink, NullSink, PgLogSink, SinkError};
