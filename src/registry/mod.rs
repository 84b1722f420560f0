//! Session manager: maps each model identifier to at most one live worker.
//!
//! Central invariant: no two sessions for the same identifier, and no two
//! workers for one startup. Concurrent acquires of a loading model join the
//! in-flight startup through oneshot waiters and all resolve with the same
//! handle. A failed startup rejects every waiter and removes the session,
//! so the next acquire retries from scratch instead of being stuck.
//!
//! The identifier→session map is the only shared mutable state; it is
//! locked in short synchronous sections only and never held across an
//! await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::config::{DevicePreference, HubConfig};
use crate::error::HubError;
use crate::gpu::AcceleratorProbe;
use crate::pipeline::{Device, PipelineFactory, TaskKind};
use crate::worker::protocol::{StartupCommand, WorkerEvent};
use crate::worker::runtime::{spawn_worker, WorkerHandle};
use crate::{log_debug, log_info, log_warn};

/// Lifecycle state of one model identifier.
///
/// `not-loaded → loading → {ready | error}`; release (and automatic removal
/// after a startup failure) resets to `not-loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NotLoaded,
    Loading,
    Ready,
    /// Terminal startup-failure state. A failed session is rejected and
    /// removed in one locked step, so `status` never actually returns this;
    /// the variant completes the state machine for callers matching on it.
    Error,
}

type StartupWaiter = oneshot::Sender<Result<WorkerHandle, HubError>>;

enum Session {
    /// Startup in flight. `epoch` ties the entry to the driver task that
    /// created it, so a release-then-reacquire cannot be resolved by a
    /// stale driver.
    Loading {
        epoch: u64,
        waiters: Vec<StartupWaiter>,
    },
    Ready { handle: WorkerHandle },
}

type SessionMap = Arc<Mutex<HashMap<String, Session>>>;

/// The session manager. Explicitly constructed and passed by reference;
/// process lifetime is scoped by whoever owns the application root.
pub struct ModelRegistry {
    factory: Arc<dyn PipelineFactory>,
    config: HubConfig,
    probe: AcceleratorProbe,
    sessions: SessionMap,
    next_epoch: AtomicU64,
}

impl ModelRegistry {
    pub fn new(factory: Arc<dyn PipelineFactory>, config: HubConfig) -> Self {
        Self::with_probe(factory, config, AcceleratorProbe::new())
    }

    /// Construct with an injected capability probe.
    pub fn with_probe(
        factory: Arc<dyn PipelineFactory>,
        config: HubConfig,
        probe: AcceleratorProbe,
    ) -> Self {
        Self {
            factory,
            config,
            probe,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Get a handle to the worker serving `model_id`, starting one if
    /// needed.
    ///
    /// Ready sessions resolve immediately with the existing handle. If a
    /// startup is already in flight the caller joins it — a second worker is
    /// never spawned for the same identifier. On startup failure every
    /// joined caller is rejected and the session is removed.
    pub async fn acquire(
        &self,
        model_id: &str,
        task_kind: TaskKind,
    ) -> Result<WorkerHandle, HubError> {
        if model_id.is_empty() {
            return Err(HubError::Invalid("empty model id".to_string()));
        }

        // Resolve the device up front: the probe may suspend, and the map
        // must only be touched in synchronous sections.
        let device = self.select_device().await;

        let rx = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(model_id) {
                Some(Session::Ready { handle }) => return Ok(handle.clone()),
                Some(Session::Loading { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    sessions.insert(
                        model_id.to_string(),
                        Session::Loading {
                            epoch,
                            waiters: vec![tx],
                        },
                    );
                    self.start_worker(model_id.to_string(), task_kind, device, epoch);
                    rx
                }
            }
        };

        // Waiters are dropped when the session is released mid-startup;
        // that is a termination, not a startup failure.
        rx.await.unwrap_or(Err(HubError::WorkerGone))
    }

    /// Current status of `model_id`. Pure read.
    pub fn status(&self, model_id: &str) -> SessionStatus {
        match self.sessions.lock().unwrap().get(model_id) {
            Some(Session::Loading { .. }) => SessionStatus::Loading,
            Some(Session::Ready { .. }) => SessionStatus::Ready,
            None => SessionStatus::NotLoaded,
        }
    }

    /// Terminate the worker for `model_id` (if any) and forget the session.
    /// Idempotent; releasing an unknown identifier is a no-op.
    pub fn release(&self, model_id: &str) {
        let removed = self.sessions.lock().unwrap().remove(model_id);
        match removed {
            Some(Session::Ready { handle }) => {
                handle.terminate();
                log_info!("released model {model_id}");
            }
            Some(Session::Loading { waiters, .. }) => {
                // Dropping the waiters rejects every joined acquire; the
                // startup driver sees the entry gone and tears the worker
                // down once it reports in.
                drop(waiters);
                log_info!("released model {model_id} while loading");
            }
            None => {}
        }
    }

    /// Whether the host supports the accelerated backend. Cached; intended
    /// for compatibility warnings in the UI layer.
    pub async fn accelerator_available(&self) -> bool {
        self.probe.probe().await
    }

    async fn select_device(&self) -> Device {
        match self.config.device {
            DevicePreference::Gpu => Device::Gpu,
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => {
                if self.probe.probe().await {
                    Device::Gpu
                } else {
                    Device::Cpu
                }
            }
        }
    }

    /// Spawn the worker and a driver task that waits for the terminal
    /// startup signal, then resolves or rejects every waiter.
    fn start_worker(&self, model_id: String, task_kind: TaskKind, device: Device, epoch: u64) {
        let command = StartupCommand {
            model_id: model_id.clone(),
            task_kind,
        };
        let spawned = spawn_worker(command, self.factory.clone(), device);
        let sessions = self.sessions.clone();

        log_info!("loading model {model_id} ({task_kind}, {device:?})");

        tokio::spawn(async move {
            let mut events = spawned.events;
            let outcome = loop {
                match events.recv().await {
                    Some(WorkerEvent::Initiate { .. }) => {
                        log_debug!("model {model_id} initiating");
                    }
                    Some(WorkerEvent::Ready { .. }) => break Ok(()),
                    Some(WorkerEvent::Error { error }) => break Err(error),
                    Some(WorkerEvent::Complete { .. }) => {
                        log_warn!("model {model_id} sent a result before ready; dropped");
                    }
                    None => break Err("worker exited before ready".to_string()),
                }
            };

            match outcome {
                Ok(()) => {
                    let handle =
                        WorkerHandle::new(model_id.clone(), task_kind, spawned.cmd_tx, events);
                    let waiters = {
                        let mut sessions = sessions.lock().unwrap();
                        match sessions.get_mut(&model_id) {
                            Some(Session::Loading { epoch: e, waiters }) if *e == epoch => {
                                let waiters = std::mem::take(waiters);
                                sessions.insert(
                                    model_id.clone(),
                                    Session::Ready {
                                        handle: handle.clone(),
                                    },
                                );
                                Some(waiters)
                            }
                            _ => None,
                        }
                    };
                    match waiters {
                        Some(waiters) => {
                            log_info!("model {model_id} ready");
                            for tx in waiters {
                                let _ = tx.send(Ok(handle.clone()));
                            }
                        }
                        None => {
                            // Released (or superseded) while loading.
                            handle.terminate();
                            log_info!("model {model_id} became ready after release; terminated");
                        }
                    }
                }
                Err(error) => {
                    let err = classify_startup_error(error);
                    let waiters = {
                        let mut sessions = sessions.lock().unwrap();
                        match sessions.get(&model_id) {
                            Some(Session::Loading { epoch: e, .. }) if *e == epoch => {
                                match sessions.remove(&model_id) {
                                    Some(Session::Loading { waiters, .. }) => Some(waiters),
                                    _ => None,
                                }
                            }
                            _ => None,
                        }
                    };
                    log_warn!("model {model_id} failed to start: {err}");
                    if let Some(waiters) = waiters {
                        for tx in waiters {
                            let _ = tx.send(Err(err.clone()));
                        }
                    }
                }
            }
        });
    }
}

/// Canonical unsupported-kind messages keep their own error class; every
/// other startup failure is a [`HubError::Startup`].
fn classify_startup_error(error: String) -> HubError {
    if error.starts_with("unsupported task kind") {
        HubError::UnsupportedTask(error)
    } else {
        HubError::Startup(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::mock::MockPipelineFactory;
    use crate::worker::protocol::TaskRequest;
    use serde_json::json;
    use std::time::Duration;

    fn registry(factory: Arc<MockPipelineFactory>) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(factory, HubConfig::default()))
    }

    fn text(text: &str) -> TaskRequest {
        TaskRequest::Text {
            text: text.to_string(),
            options: None,
        }
    }

    #[tokio::test]
    async fn acquire_loads_and_serves_a_request() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());

        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);
        let handle = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert_eq!(registry.status("m1"), SessionStatus::Ready);

        let result = handle.request(text("hello")).await.unwrap();
        assert_eq!(result, json!([{"generated_text": "hello world"}]));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn empty_model_id_is_rejected() {
        let registry = registry(MockPipelineFactory::new());
        let error = registry
            .acquire("", TaskKind::TextGeneration)
            .await
            .unwrap_err();
        assert!(matches!(error, HubError::Invalid(_)));
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_worker() {
        let factory = MockPipelineFactory::new();
        let gate = factory.gate_startup();
        let registry = registry(factory.clone());

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("m1", TaskKind::TextGeneration).await })
        };
        let second = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("m1", TaskKind::TextGeneration).await })
        };

        // Let both callers reach the in-flight startup before it finishes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.status("m1"), SessionStatus::Loading);
        gate.send(()).unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(first.same_worker(&second));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn ready_sessions_are_reused() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());

        let first = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        let second = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert!(first.same_worker(&second));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn startup_failure_rejects_and_clears_the_session() {
        let factory = MockPipelineFactory::new();
        factory.fail_startup_with("weights not found");
        let registry = registry(factory.clone());

        let error = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            HubError::Startup("weights not found".to_string())
        );
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);

        // A retry spawns a fresh worker rather than reusing the failed one.
        factory.clear_startup_failure();
        let handle = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert_eq!(factory.created(), 2);
        assert_eq!(registry.status("m1"), SessionStatus::Ready);
        drop(handle);
    }

    #[tokio::test]
    async fn unsupported_task_kind_is_its_own_error_class() {
        let factory = MockPipelineFactory::new();
        factory.limit_tasks(&[TaskKind::TextGeneration]);
        let registry = registry(factory.clone());

        let error = registry
            .acquire("m1", TaskKind::TextToSpeech)
            .await
            .unwrap_err();
        match error {
            HubError::UnsupportedTask(message) => {
                assert!(message.contains("unsupported task kind"));
                assert!(message.contains("text-to-speech"));
            }
            other => panic!("expected unsupported task error, got {other:?}"),
        }
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn request_failure_keeps_the_session_ready() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());
        let handle = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();

        let error = handle.request(text("boom")).await.unwrap_err();
        assert_eq!(
            error,
            HubError::Request("mock pipeline failure".to_string())
        );
        assert_eq!(registry.status("m1"), SessionStatus::Ready);

        // The very next request works without reacquiring.
        let result = handle.request(text("hello")).await.unwrap();
        assert_eq!(result, json!([{"generated_text": "hello world"}]));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn release_resets_status_and_is_idempotent() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());
        registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert_eq!(registry.status("m1"), SessionStatus::Ready);

        registry.release("m1");
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);

        // Releasing again, or releasing something never loaded, is a no-op.
        registry.release("m1");
        registry.release("never-loaded");
        assert_eq!(registry.status("never-loaded"), SessionStatus::NotLoaded);
    }

    #[tokio::test]
    async fn release_rejects_requests_on_old_handles() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());
        let handle = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();

        registry.release("m1");
        let error = handle.request(text("late")).await.unwrap_err();
        assert_eq!(error, HubError::WorkerGone);
    }

    #[tokio::test]
    async fn release_rejects_a_request_in_flight() {
        let factory = MockPipelineFactory::new();
        let gate = factory.gate_requests();
        let registry = registry(factory.clone());
        let handle = registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request(text("hello")).await })
        };

        // The worker is now blocked inside the pipeline; release mid-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.release("m1");

        let error = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("request must reject, not hang")
            .unwrap()
            .unwrap_err();
        assert_eq!(error, HubError::WorkerGone);
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);
        drop(gate);
    }

    #[tokio::test]
    async fn release_during_startup_rejects_joined_waiters() {
        let factory = MockPipelineFactory::new();
        let gate = factory.gate_startup();
        let registry = registry(factory.clone());

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire("m1", TaskKind::TextGeneration).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.status("m1"), SessionStatus::Loading);

        registry.release("m1");
        gate.send(()).unwrap();

        let error = pending.await.unwrap().unwrap_err();
        assert_eq!(error, HubError::WorkerGone);
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);

        // The identifier is immediately reusable (unblock the next startup).
        gate.send(()).unwrap();
        registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert_eq!(registry.status("m1"), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn distinct_models_are_independent() {
        let factory = MockPipelineFactory::new();
        let registry = registry(factory.clone());

        let (h1, h2) = tokio::join!(
            registry.acquire("m1", TaskKind::TextGeneration),
            registry.acquire("m2", TaskKind::ZeroShotClassification),
        );
        let h1 = h1.unwrap();
        let h2 = h2.unwrap();
        assert!(!h1.same_worker(&h2));
        assert_eq!(factory.created(), 2);

        registry.release("m1");
        assert_eq!(registry.status("m1"), SessionStatus::NotLoaded);
        assert_eq!(registry.status("m2"), SessionStatus::Ready);

        let result = h2
            .request(TaskRequest::ZeroShot {
                text: "a film about space".to_string(),
                labels: vec!["sci-fi".to_string(), "romance".to_string()],
                options: None,
            })
            .await
            .unwrap();
        assert_eq!(result["labels"], json!(["sci-fi", "romance"]));
    }

    #[tokio::test]
    async fn device_preference_is_honored_without_probing() {
        let factory = MockPipelineFactory::new();
        let config = HubConfig {
            device: DevicePreference::Cpu,
            ..HubConfig::default()
        };
        // A probe that would fail loudly if consulted.
        let probe = AcceleratorProbe::with_query(Arc::new(|| panic!("probe must not run")));
        let registry = Arc::new(ModelRegistry::with_probe(factory, config, probe));

        registry
            .acquire("m1", TaskKind::TextGeneration)
            .await
            .unwrap();
        assert_eq!(registry.status("m1"), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn accelerator_availability_is_exposed_to_the_ui() {
        let factory = MockPipelineFactory::new();
        let probe = AcceleratorProbe::with_query(Arc::new(|| Ok(false)));
        let registry = ModelRegistry::with_probe(factory, HubConfig::default(), probe);
        assert!(!registry.accelerator_available().await);
    }
}
