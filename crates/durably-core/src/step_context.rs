//! The handle a job function receives each time it runs (or resumes).
//!
//! `StepContext::run` is the replay primitive: it looks for a persisted,
//! completed step with the given name before invoking the closure, so a
//! crash-and-restart resumes a job from the first unfinished step rather
//! than re-running side effects that already landed.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::DurablyError;
use crate::event::{EventEmitter, EventKind};
use crate::model::{LogLevel, Progress, RunStatus, StepStatus};
use crate::storage::{Storage, UpdateRunFields};

pub struct StepContext {
    run_id: String,
    job_name: String,
    storage: Arc<dyn Storage>,
    emitter: EventEmitter,
    step_counter: AtomicI64,
    current_step_name: Mutex<Option<String>>,
}

impl StepContext {
    pub fn new(
        run_id: String,
        job_name: String,
        storage: Arc<dyn Storage>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            run_id,
            job_name,
            storage,
            emitter,
            step_counter: AtomicI64::new(0),
            current_step_name: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Runs `f` under memoized replay semantics, or short-circuits to the
    /// value the step produced on a prior pass.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, DurablyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DurablyError>>,
    {
        let index = self.step_counter.fetch_add(1, Ordering::SeqCst);

        if let Some(existing) = self.storage.get_completed_step(&self.run_id, name).await? {
            let value: T = serde_json::from_value(existing.output.unwrap_or(Value::Null))?;
            return Ok(value);
        }

        if let Some(run) = self.storage.get_run(&self.run_id).await? {
            if run.status == RunStatus::Cancelled {
                return Err(DurablyError::Cancelled {
                    run_id: self.run_id.clone(),
                });
            }
        }

        *self.current_step_name.lock().unwrap() = Some(name.to_string());
        let started_at = Utc::now();
        self.emitter.emit(EventKind::StepStart {
            run_id: self.run_id.clone(),
            job_name: self.job_name.clone(),
            step_name: name.to_string(),
            step_index: index,
        });

        let outcome = f().await;
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();

        let result = match outcome {
            Ok(value) => {
                let output = serde_json::to_value(&value)?;
                self.storage
                    .create_step(
                        &self.run_id,
                        name,
                        index,
                        StepStatus::Completed,
                        Some(output.clone()),
                        None,
                        started_at,
                        Some(completed_at),
                    )
                    .await?;
                self.storage
                    .update_run(
                        &self.run_id,
                        UpdateRunFields {
                            current_step_index: Some(index + 1),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.emitter.emit(EventKind::StepComplete {
                    run_id: self.run_id.clone(),
                    job_name: self.job_name.clone(),
                    step_name: name.to_string(),
                    step_index: index,
                    output,
                    duration_ms,
                });
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                self.storage
                    .create_step(
                        &self.run_id,
                        name,
                        index,
                        StepStatus::Failed,
                        None,
                        Some(message.clone()),
                        started_at,
                        Some(completed_at),
                    )
                    .await?;
                self.emitter.emit(EventKind::StepFail {
                    run_id: self.run_id.clone(),
                    job_name: self.job_name.clone(),
                    step_name: name.to_string(),
                    step_index: index,
                    error: message,
                });
                Err(err)
            }
        };

        *self.current_step_name.lock().unwrap() = None;
        result
    }

    /// Records progress against the run. Storage failures are logged and
    /// swallowed: progress is a best-effort signal, not part of the
    /// execution contract.
    pub async fn progress(&self, current: i64, total: Option<i64>, message: Option<String>) {
        let progress = Progress {
            current,
            total,
            message,
        };
        if let Err(err) = self
            .storage
            .update_run(
                &self.run_id,
                UpdateRunFields {
                    progress: Some(progress.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %err, "failed to persist progress");
        }
        self.emitter.emit(EventKind::RunProgress {
            run_id: self.run_id.clone(),
            job_name: self.job_name.clone(),
            progress,
        });
    }

    pub fn log(&self) -> LogHandle<'_> {
        LogHandle { ctx: self }
    }

    async fn write_log(&self, level: LogLevel, message: String, data: Option<Value>) {
        let step_name = self.current_step_name.lock().unwrap().clone();
        if let Err(err) = self
            .storage
            .create_log(&self.run_id, step_name.clone(), level, &message, data.clone())
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %err, "failed to persist log");
        }
        self.emitter.emit(EventKind::LogWrite {
            run_id: self.run_id.clone(),
            step_name,
            level,
            message,
            data,
        });
    }
}

/// Borrowed handle exposing the `ctx.log().info(...)` style the
/// specification describes as field access on the step context.
pub struct LogHandle<'a> {
    ctx: &'a StepContext,
}

impl LogHandle<'_> {
    pub async fn info(&self, message: impl Into<String>, data: Option<Value>) {
        self.ctx.write_log(LogLevel::Info, message.into(), data).await;
    }

    pub async fn warn(&self, message: impl Into<String>, data: Option<Value>) {
        self.ctx.write_log(LogLevel::Warn, message.into(), data).await;
    }

    pub async fn error(&self, message: impl Into<String>, data: Option<Value>) {
        self.ctx.write_log(LogLevel::Error, message.into(), data).await;
    }
}
