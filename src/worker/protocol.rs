//! Message contract between the registry and a worker.
//!
//! This is the one bit-exact surface of the crate: the startup command is
//! camelCase, worker events are tagged on `status`, and task requests are
//! distinguished by their field shape. Any front end speaking this protocol
//! interoperates with the workers unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::TaskKind;

/// Sent once to a freshly spawned worker to begin model loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupCommand {
    pub model_id: String,
    pub task_kind: TaskKind,
}

/// Every message a worker emits. Closed union over the `status` tag, so an
/// unrecognized status is a deserialization error rather than a silent drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// Startup has begun. Informational; the registry only logs it.
    Initiate {
        #[serde(rename = "type")]
        task_kind: TaskKind,
    },
    /// The model is loaded; the worker accepts task requests from here on.
    Ready {
        #[serde(rename = "type")]
        task_kind: TaskKind,
    },
    /// Terminal reply to one task request. The result is passed through to
    /// the caller unmodified.
    Complete { result: Value },
    /// Startup or request failure, as a plain descriptive string.
    Error { error: String },
}

/// Task requests, shaped per task kind exactly as the front end sends them.
/// Untagged: the set of fields selects the variant, so `ZeroShot` must come
/// before `Text` (its shape is a superset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRequest {
    /// `{text, labels, options?}` — zero-shot classification.
    ZeroShot {
        text: String,
        labels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    /// `{text, options?}` — generation, feature extraction, text-to-speech.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    /// `{audio}` — speech recognition.
    Audio { audio: Vec<u8> },
    /// `{image, options?}` — classification and depth estimation, as a data URI.
    Image {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
}

impl TaskRequest {
    /// Whether this request shape is valid for a worker serving `kind`.
    pub fn matches(&self, kind: TaskKind) -> bool {
        matches!(
            (self, kind),
            (
                TaskRequest::Text { .. },
                TaskKind::TextGeneration | TaskKind::FeatureExtraction | TaskKind::TextToSpeech,
            ) | (TaskRequest::Audio { .. }, TaskKind::SpeechRecognition)
                | (
                    TaskRequest::Image { .. },
                    TaskKind::ImageClassification | TaskKind::DepthEstimation,
                )
                | (
                    TaskRequest::ZeroShot { .. },
                    TaskKind::ZeroShotClassification,
                )
        )
    }
}
