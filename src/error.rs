//! Error taxonomy for session and worker failures.
//!
//! Worker-side failures cross the thread boundary as plain descriptive
//! strings (error objects cannot cross it intact) and are re-wrapped into
//! these variants on the caller side.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Worker reported an error before reaching ready. The session is
    /// discarded, so a subsequent acquire retries from scratch.
    #[error("model startup failed: {0}")]
    Startup(String),

    /// Worker reported an error while servicing a task request. The session
    /// stays ready; the caller can submit another request immediately.
    #[error("task request failed: {0}")]
    Request(String),

    /// The injected factory has no pipeline for this task kind.
    #[error("{0}")]
    UnsupportedTask(String),

    /// The backing worker was terminated while a reply was outstanding, or
    /// before any request could be sent.
    #[error("worker terminated")]
    WorkerGone,

    /// Rejected before reaching a worker (e.g. empty model identifier).
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("config error: {0}")]
    Config(String),
}
