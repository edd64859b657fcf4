//! `Durably`: the facade applications construct once, register jobs
//! against, and drive via `init`/`stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::DurablyError;
use crate::event::{Event, EventEmitter, EventKind, Subscription};
use crate::job::{JobDefinition, JobHandle, JobRegistry};
use crate::model::{Run, RunStatus};
use crate::storage::Storage;
use crate::worker::{Worker, WorkerConfig, WorkerHandle};

pub struct Durably {
    storage: Arc<dyn Storage>,
    emitter: EventEmitter,
    registry: JobRegistry,
    worker_config: WorkerConfig,
    worker: AsyncMutex<Option<(Arc<Worker>, WorkerHandle)>>,
    migrated: AtomicBool,
}

impl Durably {
    pub fn new(storage: Arc<dyn Storage>, worker_config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            storage,
            emitter: EventEmitter::new(),
            registry: JobRegistry::new(),
            worker_config,
            worker: AsyncMutex::new(None),
            migrated: AtomicBool::new(false),
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn register_job<In, Out>(
        &self,
        name: impl Into<String>,
        definition: JobDefinition<In, Out>,
    ) -> Result<JobHandle<In, Out>, DurablyError>
    where
        In: DeserializeOwned + Serialize + Send + Sync + 'static,
        Out: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.registry
            .register(name, definition, self.storage.clone(), self.emitter.clone())
    }

    /// Runs pending schema migrations, idempotently, then starts the worker
    /// loop. Safe to call more than once; only the first call migrates.
    pub async fn init(&self) -> Result<(), DurablyError> {
        if !self.migrated.swap(true, Ordering::SeqCst) {
            self.storage.migrate().await?;
        }
        self.start_worker().await;
        Ok(())
    }

    async fn start_worker(&self) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }
        let worker = Worker::new(
            self.storage.clone(),
            self.emitter.clone(),
            self.registry.clone(),
            self.worker_config,
        );
        let handle = worker.start();
        *guard = Some((worker, handle));
    }

    pub async fn stop(&self) {
        let mut guard = self.worker.lock().await;
        if let Some((_worker, handle)) = guard.take() {
            handle.stop().await;
        }
    }

    pub async fn retry(&self, run_id: &str) -> Result<Run, DurablyError> {
        let run = self.require_run(run_id).await?;
        if run.status != RunStatus::Failed {
            return Err(DurablyError::IllegalState {
                op: "retry".to_string(),
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }
        let updated = self
            .storage
            .update_run(
                run_id,
                crate::storage::UpdateRunFields {
                    status: Some(RunStatus::Pending),
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await?;
        self.emitter.emit(EventKind::RunRetry {
            run_id: updated.id.clone(),
            job_name: updated.job_name.clone(),
        });
        Ok(updated)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<Run, DurablyError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(DurablyError::IllegalState {
                op: "cancel".to_string(),
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }
        let updated = self
            .storage
            .update_run(
                run_id,
                crate::storage::UpdateRunFields {
                    status: Some(RunStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await?;
        self.emitter.emit(EventKind::RunCancel {
            run_id: updated.id.clone(),
            job_name: updated.job_name.clone(),
        });
        Ok(updated)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<(), DurablyError> {
        let run = self.require_run(run_id).await?;
        if !run.status.is_terminal() {
            return Err(DurablyError::IllegalState {
                op: "delete".to_string(),
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }
        self.storage.delete_run(run_id).await
    }

    async fn require_run(&self, run_id: &str) -> Result<Run, DurablyError> {
        self.storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| DurablyError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Opens a pull-based stream of every event for `run_id`, closing itself
    /// once the run reaches `run:complete`. The caller drops the stream (or
    /// stops polling it) to unsubscribe; `run:fail` and `run:cancel` leave
    /// the stream open, since a failed run may later be retried.
    pub fn subscribe(&self, run_id: impl Into<String>) -> RunEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.emitter.on_run(run_id, move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        RunEventStream {
            rx,
            _subscription: subscription,
            closed: false,
        }
    }

    /// Opens a pull-based stream of every event across every run, for the
    /// HTTP server's global `runs:subscribe` endpoint. When `job_name` is
    /// given, the stream is scoped to that job and drops `log:write`
    /// entirely, since a log entry carries no job name of its own to match
    /// against.
    pub fn subscribe_all(&self, job_name: Option<String>) -> RunEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = match job_name {
            Some(job_name) => self.emitter.on_job(job_name, move |event: &Event| {
                let _ = tx.send(event.clone());
            }),
            None => self.emitter.on_any(move |event: &Event| {
                let _ = tx.send(event.clone());
            }),
        };
        RunEventStream {
            rx,
            _subscription: subscription,
            closed: false,
        }
    }
}

pub struct RunEventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    _subscription: Subscription,
    closed: bool,
}

impl RunEventStream {
    pub async fn next(&mut self) -> Option<Event> {
        if self.closed {
            return None;
        }
        let event = self.rx.recv().await?;
        if matches!(event.kind, EventKind::RunComplete { .. }) {
            self.closed = true;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{define_job, TriggerOptions};
    use crate::storage::InMemoryStorage;
    use crate::validation::SerdeValidator;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Input {
        value: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Output {
        doubled: i64,
    }

    #[tokio::test]
    async fn retry_requires_a_failed_run() {
        let durably = Durably::new(Arc::new(InMemoryStorage::new()), WorkerConfig::default());
        let handle = durably
            .register_job(
                "double",
                define_job(
                    "double",
                    SerdeValidator::<Input>::new(),
                    None,
                    |_ctx, input: Input| async move {
                        Ok(Output {
                            doubled: input.value * 2,
                        })
                    },
                ),
            )
            .unwrap();
        let run = handle
            .trigger(Input { value: 1 }, TriggerOptions::default())
            .await
            .unwrap();
        let err = durably.retry(&run.id).await.unwrap_err();
        assert!(matches!(err, DurablyError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_runs() {
        let durably = Durably::new(Arc::new(InMemoryStorage::new()), WorkerConfig::default());
        let handle = durably
            .register_job(
                "double",
                define_job(
                    "double",
                    SerdeValidator::<Input>::new(),
                    None,
                    |_ctx, input: Input| async move {
                        Ok(Output {
                            doubled: input.value * 2,
                        })
                    },
                ),
            )
            .unwrap();
        let run = handle
            .trigger(Input { value: 1 }, TriggerOptions::default())
            .await
            .unwrap();
        durably.cancel(&run.id).await.unwrap();
        let err = durably.cancel(&run.id).await.unwrap_err();
        assert!(matches!(err, DurablyError::IllegalState { .. }));
    }
}
