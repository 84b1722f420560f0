//! model-hub: lifecycle management for locally-executed inference models.
//!
//! Maps a logical model identifier to exactly one live, isolated worker,
//! coordinates the asynchronous startup handshake, multiplexes task
//! request/reply messages, and tears the worker down deterministically.
//!
//! The crate does not implement any inference math. Callers inject a
//! [`pipeline::PipelineFactory`] that turns a (task kind, model id) pair
//! into a runnable pipeline; everything else — status tracking, startup
//! join semantics, release, the accelerator probe — lives here.

pub mod config;
pub mod error;
pub mod gpu;
pub mod logger;
pub mod pipeline;
pub mod registry;
pub mod worker;

pub use config::{DevicePreference, HubConfig};
pub use error::HubError;
pub use gpu::AcceleratorProbe;
pub use pipeline::{Device, Pipeline, PipelineFactory, TaskKind};
pub use registry::{ModelRegistry, SessionStatus};
pub use worker::protocol::{StartupCommand, TaskRequest, WorkerEvent};
pub use worker::runtime::WorkerHandle;
