//! Worker subsystem: the message protocol and the per-model runtime thread.

pub mod protocol;
pub mod runtime;

pub use protocol::{StartupCommand, TaskRequest, WorkerEvent};
pub use runtime::WorkerHandle;
