//! The single-worker polling loop: recover stale runs, claim the next
//! pending one, execute it with a heartbeat running alongside, and
//! finalize it based on the outcome.
//!
//! Grounded in the claim/heartbeat/execute shape of a multi-worker durable
//! execution runtime, simplified for a single in-process worker: there is
//! no leader election and no `FOR UPDATE SKIP LOCKED` contention to resolve,
//! since exactly one worker ever claims runs against a given store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::DurablyError;
use crate::event::{EventEmitter, EventKind};
use crate::job::JobRegistry;
use crate::model::{Run, RunStatus};
use crate::step_context::StepContext;
use crate::storage::{RunFilter, Storage, UpdateRunFields};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub polling_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(30),
        }
    }
}

pub struct Worker {
    storage: Arc<dyn Storage>,
    emitter: EventEmitter,
    registry: JobRegistry,
    config: WorkerConfig,
    stop_flag: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

/// Handle to a running worker loop. Dropping it does not stop the loop;
/// call `stop` explicitly.
pub struct WorkerHandle {
    task: JoinHandle<()>,
    stop_flag: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_flag.notify_waiters();
        let _ = self.task.await;
    }
}

impl Worker {
    pub fn new(
        storage: Arc<dyn Storage>,
        emitter: EventEmitter,
        registry: JobRegistry,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            emitter,
            registry,
            config,
            stop_flag: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn start(self: &Arc<Self>) -> WorkerHandle {
        let worker = self.clone();
        let stop_flag = self.stop_flag.clone();
        let stopped = self.stopped.clone();
        let task = tokio::spawn(async move { worker.run_loop().await });
        WorkerHandle {
            task,
            stop_flag,
            stopped,
        }
    }

    async fn run_loop(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "worker iteration failed");
                self.emitter.emit(EventKind::WorkerError {
                    message: err.to_string(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = self.stop_flag.notified() => break,
            }
        }
    }

    async fn tick(&self) -> Result<(), DurablyError> {
        self.recover_stale().await?;
        let running = self
            .storage
            .get_runs(RunFilter {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await?;
        let keys_in_flight: Vec<String> = running
            .iter()
            .filter_map(|r| r.concurrency_key.clone())
            .collect();
        let Some(run) = self.storage.get_next_pending_run(&keys_in_flight).await? else {
            return Ok(());
        };
        self.claim_and_execute(run).await
    }

    async fn recover_stale(&self) -> Result<(), DurablyError> {
        let threshold = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold)
                .unwrap_or(chrono::Duration::seconds(30));
        let running = self
            .storage
            .get_runs(RunFilter {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await?;
        for run in running {
            if run.heartbeat_at < threshold {
                tracing::warn!(run_id = %run.id, "reclaiming stale run");
                self.storage
                    .update_run(
                        &run.id,
                        UpdateRunFields {
                            status: Some(RunStatus::Pending),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn claim_and_execute(&self, run: Run) -> Result<(), DurablyError> {
        let Some(job) = self.registry.get(&run.job_name) else {
            self.storage
                .update_run(
                    &run.id,
                    UpdateRunFields {
                        status: Some(RunStatus::Failed),
                        error: Some(format!("unknown job: {}", run.job_name)),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        };

        let now = chrono::Utc::now();
        let claimed = self
            .storage
            .update_run(
                &run.id,
                UpdateRunFields {
                    status: Some(RunStatus::Running),
                    heartbeat_at: Some(now),
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await?;

        let heartbeat_storage = self.storage.clone();
        let heartbeat_emitter = self.emitter.clone();
        let heartbeat_run_id = claimed.id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                if let Err(err) = heartbeat_storage
                    .update_run(
                        &heartbeat_run_id,
                        UpdateRunFields {
                            heartbeat_at: Some(chrono::Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    heartbeat_emitter.emit(EventKind::WorkerError {
                        message: format!("heartbeat failed for run {heartbeat_run_id}: {err}"),
                    });
                }
            }
        });

        let ctx = StepContext::new(
            claimed.id.clone(),
            claimed.job_name.clone(),
            self.storage.clone(),
            self.emitter.clone(),
        );
        self.emitter.emit(EventKind::RunStart {
            run_id: claimed.id.clone(),
            job_name: claimed.job_name.clone(),
            payload: claimed.payload.clone(),
        });

        let started = Instant::now();
        let outcome = job.run(ctx, claimed.payload.clone()).await;
        heartbeat_task.abort();

        self.finalize(&claimed, outcome, started.elapsed()).await
    }

    async fn finalize(
        &self,
        run: &Run,
        outcome: Result<serde_json::Value, DurablyError>,
        elapsed: std::time::Duration,
    ) -> Result<(), DurablyError> {
        // A cancel requested mid-execution wins over whatever the job
        // function returned; the row is already in its terminal state.
        let current = self.storage.get_run(&run.id).await?;
        if matches!(current.as_ref().map(|r| r.status), Some(RunStatus::Cancelled)) {
            return Ok(());
        }

        match outcome {
            Ok(output) => {
                self.storage
                    .update_run(
                        &run.id,
                        UpdateRunFields {
                            status: Some(RunStatus::Completed),
                            output: Some(output.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.emitter.emit(EventKind::RunComplete {
                    run_id: run.id.clone(),
                    job_name: run.job_name.clone(),
                    output,
                    duration_ms: elapsed.as_millis() as i64,
                });
            }
            Err(DurablyError::Cancelled { .. }) => {}
            Err(err) => {
                let steps = self.storage.get_steps(&run.id).await.unwrap_or_default();
                let failed_step_name = steps
                    .iter()
                    .rev()
                    .find(|s| s.status == crate::model::StepStatus::Failed)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                self.storage
                    .update_run(
                        &run.id,
                        UpdateRunFields {
                            status: Some(RunStatus::Failed),
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.emitter.emit(EventKind::RunFail {
                    run_id: run.id.clone(),
                    job_name: run.job_name.clone(),
                    error: err.to_string(),
                    failed_step_name,
                });
            }
        }
        Ok(())
    }
}
