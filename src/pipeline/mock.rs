//! Scriptable pipeline factory for tests and demos (no real inference).
//!
//! Mirrors the production factory surface: startup can be made to fail or
//! block, the supported task set can be narrowed, and every creation is
//! counted so tests can assert on worker spawns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use serde_json::{json, Value};

use crate::pipeline::{Device, Pipeline, PipelineFactory, TaskKind};
use crate::worker::protocol::TaskRequest;

#[derive(Default)]
pub struct MockPipelineFactory {
    created: AtomicUsize,
    fail_startup: Mutex<Option<String>>,
    gate: Mutex<Option<Receiver<()>>>,
    request_gate: Mutex<Option<Receiver<()>>>,
    supported: Mutex<Option<Vec<TaskKind>>>,
}

impl MockPipelineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many pipelines this factory has created (== workers spawned past
    /// the supports check).
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make every subsequent startup fail with `message`.
    pub fn fail_startup_with(&self, message: &str) {
        *self.fail_startup.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_startup_failure(&self) {
        *self.fail_startup.lock().unwrap() = None;
    }

    /// Block each subsequent creation until one message is sent on the
    /// returned channel. Lets tests hold a startup in flight.
    pub fn gate_startup(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Block each subsequent `Pipeline::run` until one message is sent on
    /// the returned channel. Lets tests hold a task request in flight.
    pub fn gate_requests(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.request_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Narrow the supported task set; everything else is reported as an
    /// unsupported task kind by the worker.
    pub fn limit_tasks(&self, kinds: &[TaskKind]) {
        *self.supported.lock().unwrap() = Some(kinds.to_vec());
    }
}

impl PipelineFactory for MockPipelineFactory {
    fn supports(&self, task: TaskKind) -> bool {
        match self.supported.lock().unwrap().as_ref() {
            Some(kinds) => kinds.contains(&task),
            None => true,
        }
    }

    fn create(
        &self,
        task: TaskKind,
        _model_id: &str,
        _device: Device,
    ) -> Result<Box<dyn Pipeline>, String> {
        self.created.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }

        if let Some(message) = self.fail_startup.lock().unwrap().clone() {
            return Err(message);
        }

        Ok(Box::new(EchoPipeline {
            task,
            request_gate: self.request_gate.lock().unwrap().clone(),
        }))
    }
}

/// Deterministic stand-in pipeline. Text "boom" fails the request, text
/// "panic" panics (exercising the worker's panic containment); everything
/// else echoes a plausible task-shaped result.
struct EchoPipeline {
    task: TaskKind,
    request_gate: Option<Receiver<()>>,
}

impl Pipeline for EchoPipeline {
    fn run(&mut self, request: TaskRequest) -> Result<Value, String> {
        if let Some(rx) = &self.request_gate {
            let _ = rx.recv();
        }
        match request {
            TaskRequest::Text { text, .. } => {
                if text == "boom" {
                    return Err("mock pipeline failure".to_string());
                }
                if text == "panic" {
                    panic!("mock pipeline panic");
                }
                match self.task {
                    TaskKind::FeatureExtraction => Ok(json!([0.0, 1.0, 0.5])),
                    TaskKind::TextToSpeech => {
                        Ok(json!({"audio": [], "sampling_rate": 16000}))
                    }
                    _ => Ok(json!([{"generated_text": format!("{text} world")}])),
                }
            }
            TaskRequest::Audio { audio } => Ok(json!({"text": format!("{} bytes", audio.len())})),
            TaskRequest::Image { .. } => match self.task {
                TaskKind::DepthEstimation => Ok(json!({"depth": [[0.0]]})),
                _ => Ok(json!([{"label": "cat", "score": 0.9}])),
            },
            TaskRequest::ZeroShot { labels, .. } => {
                let scores: Vec<f64> = labels.iter().map(|_| 1.0 / labels.len() as f64).collect();
                Ok(json!({"labels": labels, "scores": scores}))
            }
        }
    }
}
