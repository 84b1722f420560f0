//! Isolated worker runtime: one dedicated OS thread per loaded model.
//!
//! Thread design mirrors the process bridge this grew out of:
//! - the worker thread blocks on a crossbeam command channel and owns the
//!   pipeline exclusively; no memory is shared with the registry or with
//!   other workers,
//! - events flow back over an unbounded tokio channel, delivered in send
//!   order,
//! - startup emits `initiate` then exactly one of `ready`/`error`; after
//!   `ready` each accepted request gets exactly one terminal reply.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};

use crate::error::HubError;
use crate::pipeline::{Device, PipelineFactory, TaskKind};
use crate::worker::protocol::{StartupCommand, TaskRequest, WorkerEvent};
use crate::{log_debug, log_warn};

/// Inbound mailbox items for the worker thread.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Run(TaskRequest),
    Shutdown,
}

/// Channel ends of a freshly spawned worker, handed to the registry's
/// startup driver. Becomes a [`WorkerHandle`] once `ready` arrives.
pub(crate) struct SpawnedWorker {
    pub cmd_tx: Sender<WorkerCommand>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Spawn an isolated worker for one (model, task kind) pair.
pub(crate) fn spawn_worker(
    command: StartupCommand,
    factory: Arc<dyn PipelineFactory>,
    device: Device,
) -> SpawnedWorker {
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let (event_tx, events) = mpsc::unbounded_channel();

    let thread_name = format!("model-worker-{}", command.model_id);
    let spawn_tx = event_tx.clone();
    if let Err(e) = thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_main(command, factory, device, cmd_rx, event_tx))
    {
        let _ = spawn_tx.send(WorkerEvent::Error {
            error: format!("failed to spawn worker thread: {e}"),
        });
    }

    SpawnedWorker { cmd_tx, events }
}

/// Worker thread body. Emits `initiate`, builds the pipeline, emits
/// `ready`/`error`, then services commands until shutdown or channel close.
fn worker_main(
    command: StartupCommand,
    factory: Arc<dyn PipelineFactory>,
    device: Device,
    cmd_rx: Receiver<WorkerCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let StartupCommand {
        model_id,
        task_kind,
    } = command;

    let _ = event_tx.send(WorkerEvent::Initiate { task_kind });

    if !factory.supports(task_kind) {
        let _ = event_tx.send(WorkerEvent::Error {
            error: format!("unsupported task kind: {task_kind}"),
        });
        return;
    }

    let created = catch_unwind(AssertUnwindSafe(|| {
        factory.create(task_kind, &model_id, device)
    }));
    let mut pipeline = match created {
        Ok(Ok(pipeline)) => pipeline,
        Ok(Err(error)) => {
            let _ = event_tx.send(WorkerEvent::Error { error });
            return;
        }
        Err(panic) => {
            let _ = event_tx.send(WorkerEvent::Error {
                error: format!("pipeline load panicked: {}", panic_message(panic)),
            });
            return;
        }
    };

    let _ = event_tx.send(WorkerEvent::Ready { task_kind });
    log_debug!("worker ready: {model_id} ({task_kind}, {device:?})");

    while let Ok(command) = cmd_rx.recv() {
        let request = match command {
            WorkerCommand::Shutdown => break,
            WorkerCommand::Run(request) => request,
        };

        if !request.matches(task_kind) {
            let _ = event_tx.send(WorkerEvent::Error {
                error: format!("request shape does not match task kind {task_kind}"),
            });
            continue;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| pipeline.run(request)));
        let event = match outcome {
            Ok(Ok(result)) => WorkerEvent::Complete { result },
            Ok(Err(error)) => WorkerEvent::Error { error },
            Err(panic) => WorkerEvent::Error {
                error: format!("pipeline panicked: {}", panic_message(panic)),
            },
        };
        if event_tx.send(event).is_err() {
            break;
        }
    }

    log_debug!("worker exiting: {model_id}");
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to one live worker. Clones all talk to the same thread; the
/// registry resolves every concurrent acquire of a model with clones of a
/// single handle.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerChannel>,
}

struct WorkerChannel {
    model_id: String,
    task_kind: TaskKind,
    cmd_tx: Sender<WorkerCommand>,
    /// Reply stream. Locked for the full request/reply exchange: the
    /// protocol carries no correlation ids, so requests are strictly
    /// one-at-a-time and replies are matched FIFO.
    events: TokioMutex<mpsc::UnboundedReceiver<WorkerEvent>>,
    terminated: AtomicBool,
    shutdown: Notify,
}

impl WorkerHandle {
    pub(crate) fn new(
        model_id: String,
        task_kind: TaskKind,
        cmd_tx: Sender<WorkerCommand>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerChannel {
                model_id,
                task_kind,
                cmd_tx,
                events: TokioMutex::new(events),
                terminated: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    pub fn task_kind(&self) -> TaskKind {
        self.inner.task_kind
    }

    /// Whether two handles are bound to the same underlying worker.
    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send one task request and await its terminal reply.
    ///
    /// Callers are serialized internally; the wait is unbounded unless the
    /// worker is released, in which case this returns [`HubError::WorkerGone`]
    /// instead of hanging.
    pub async fn request(&self, request: TaskRequest) -> Result<Value, HubError> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(HubError::WorkerGone);
        }

        let mut events = self.inner.events.lock().await;

        self.inner
            .cmd_tx
            .send(WorkerCommand::Run(request))
            .map_err(|_| HubError::WorkerGone)?;

        loop {
            if self.inner.terminated.load(Ordering::SeqCst) {
                return Err(HubError::WorkerGone);
            }
            tokio::select! {
                _ = self.inner.shutdown.notified() => return Err(HubError::WorkerGone),
                event = events.recv() => match event {
                    Some(WorkerEvent::Complete { result }) => return Ok(result),
                    Some(WorkerEvent::Error { error }) => return Err(HubError::Request(error)),
                    Some(other) => {
                        // Startup signals cannot arrive here; drop and keep waiting.
                        log_warn!(
                            "unexpected event from worker {}: {other:?}",
                            self.inner.model_id
                        );
                    }
                    None => return Err(HubError::WorkerGone),
                },
            }
        }
    }

    /// Terminate the worker. Pending and future requests on any clone of
    /// this handle observe [`HubError::WorkerGone`].
    pub(crate) fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        let _ = self.inner.cmd_tx.send(WorkerCommand::Shutdown);
        self.inner.shutdown.notify_waiters();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("model_id", &self.inner.model_id)
            .field("task_kind", &self.inner.task_kind)
            .field("terminated", &self.inner.terminated.load(Ordering::SeqCst))
            .finish()
    }
}
