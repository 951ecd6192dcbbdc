//! Database-driven process control
//!
//! Each harvester is started and stopped by a row in `system_control`.
//! The [`Supervisor`] polls the row's `enabled` flag, launches the engine
//! as a supervised task, reports heartbeat/status, and (optionally)
//! force-restarts an engine that stopped producing logs.

mod stop;
mod store;
mod supervisor;

pub use stop::StopFlag;
pub use store::{ControlError, ControlStore, PgControlStore};
pub use supervisor::{Engine, Supervisor, SupervisorConfig};
