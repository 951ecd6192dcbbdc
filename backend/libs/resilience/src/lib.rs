//! Retry policies for flaky upstream calls and store writes
//!
//! Both harvester services retry the same way: a bounded number of attempts
//! with a configurable backoff curve. The label on each call site keeps
//! retry logs attributable to a specific operation.

mod retry;

pub use retry::{with_retry, RetryConfig, RetryError};
