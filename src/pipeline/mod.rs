//! The opaque inference capability seam.
//!
//! The hub never defines numerical behavior: callers inject a
//! [`PipelineFactory`] that maps a (task kind, model id) pair to a runnable
//! [`Pipeline`]. Task inputs and outputs are task-specific JSON shapes; the
//! hub passes results through unmodified.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::protocol::TaskRequest;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// The inference capability a worker exposes. Fixed at worker startup; a
/// single worker serves exactly one task kind for exactly one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextGeneration,
    SpeechRecognition,
    ImageClassification,
    DepthEstimation,
    FeatureExtraction,
    ZeroShotClassification,
    TextToSpeech,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::TextGeneration,
        TaskKind::SpeechRecognition,
        TaskKind::ImageClassification,
        TaskKind::DepthEstimation,
        TaskKind::FeatureExtraction,
        TaskKind::ZeroShotClassification,
        TaskKind::TextToSpeech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextGeneration => "text-generation",
            TaskKind::SpeechRecognition => "speech-recognition",
            TaskKind::ImageClassification => "image-classification",
            TaskKind::DepthEstimation => "depth-estimation",
            TaskKind::FeatureExtraction => "feature-extraction",
            TaskKind::ZeroShotClassification => "zero-shot-classification",
            TaskKind::TextToSpeech => "text-to-speech",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Execution backend a pipeline is loaded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Gpu,
    Cpu,
}

/// A loaded model able to service task requests.
///
/// Runs on the worker thread that owns it; errors are plain strings because
/// they cross the worker boundary as protocol messages.
pub trait Pipeline: Send {
    fn run(&mut self, request: TaskRequest) -> Result<Value, String>;
}

/// Creates pipelines on demand. `create` is called once per worker, on the
/// worker's own thread, so it may block for as long as model loading takes.
pub trait PipelineFactory: Send + Sync {
    /// Whether this factory can build pipelines for `task`. Workers answer
    /// unsupported kinds with a protocol error instead of calling `create`.
    fn supports(&self, task: TaskKind) -> bool {
        let _ = task;
        true
    }

    fn create(
        &self,
        task: TaskKind,
        model_id: &str,
        device: Device,
    ) -> Result<Box<dyn Pipeline>, String>;
}
