//! The persistence seam.
//!
//! `durably-core` never speaks SQL directly; every place a run, step or log
//! row is read or written goes through this trait, the same separation
//! `chem-core`'s `EventStore`/`FlowRepository` traits draw between the
//! execution engine and whatever backs it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::DurablyError;
use crate::id::new_id;
use crate::model::{Log, LogLevel, Progress, Run, RunStatus, Step, StepStatus};

#[derive(Debug, Clone, Default)]
pub struct CreateRunInput {
    pub id: Option<String>,
    pub job_name: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRunFields {
    pub status: Option<RunStatus>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub clear_error: bool,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub current_step_index: Option<i64>,
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Everything the engine needs from a backing store. One concrete
/// implementation lives in `durably-sqlite`; `InMemoryStorage` below exists
/// so the engine and job-handle logic can be exercised without a database.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn migrate(&self) -> Result<(), DurablyError>;

    async fn create_run(&self, input: CreateRunInput) -> Result<(Run, bool), DurablyError>;

    async fn batch_create_runs(
        &self,
        inputs: Vec<CreateRunInput>,
    ) -> Result<Vec<(Run, bool)>, DurablyError>;

    async fn update_run(&self, id: &str, fields: UpdateRunFields) -> Result<Run, DurablyError>;

    async fn delete_run(&self, id: &str) -> Result<(), DurablyError>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>, DurablyError>;

    async fn get_runs(&self, filter: RunFilter) -> Result<Vec<Run>, DurablyError>;

    async fn get_next_pending_run(
        &self,
        exclude_concurrency_keys: &[String],
    ) -> Result<Option<Run>, DurablyError>;

    #[allow(clippy::too_many_arguments)]
    async fn create_step(
        &self,
        run_id: &str,
        name: &str,
        index: i64,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Step, DurablyError>;

    async fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, DurablyError>;

    async fn get_completed_step(
        &self,
        run_id: &str,
        name: &str,
    ) -> Result<Option<Step>, DurablyError>;

    async fn create_log(
        &self,
        run_id: &str,
        step_name: Option<String>,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<Log, DurablyError>;

    async fn get_logs(&self, run_id: &str) -> Result<Vec<Log>, DurablyError>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, Run>,
    steps: HashMap<String, Vec<Step>>,
    logs: HashMap<String, Vec<Log>>,
    insertion_order: Vec<String>,
}

/// An in-process `Storage` used by the core test suite and by callers who
/// want to exercise job definitions without a database.
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn find_by_idempotency<'a>(
    state: &'a MemoryState,
    job_name: &str,
    key: &str,
) -> Option<&'a Run> {
    state
        .runs
        .values()
        .find(|r| r.job_name == job_name && r.idempotency_key.as_deref() == Some(key))
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn migrate(&self) -> Result<(), DurablyError> {
        Ok(())
    }

    async fn create_run(&self, input: CreateRunInput) -> Result<(Run, bool), DurablyError> {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = find_by_idempotency(&state, &input.job_name, key) {
                return Ok((existing.clone(), false));
            }
        }
        let now = Utc::now();
        let id = input.id.unwrap_or_else(new_id);
        let run = Run {
            id: id.clone(),
            job_name: input.job_name,
            payload: input.payload,
            status: RunStatus::Pending,
            idempotency_key: input.idempotency_key,
            concurrency_key: input.concurrency_key,
            current_step_index: 0,
            progress: None,
            output: None,
            error: None,
            heartbeat_at: now,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(id.clone(), run.clone());
        state.insertion_order.push(id);
        Ok((run, true))
    }

    async fn batch_create_runs(
        &self,
        inputs: Vec<CreateRunInput>,
    ) -> Result<Vec<(Run, bool)>, DurablyError> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            results.push(self.create_run(input).await?);
        }
        Ok(results)
    }

    async fn update_run(&self, id: &str, fields: UpdateRunFields) -> Result<Run, DurablyError> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| DurablyError::RunNotFound {
                run_id: id.to_string(),
            })?;
        if let Some(status) = fields.status {
            run.status = status;
        }
        if let Some(output) = fields.output {
            run.output = Some(output);
        }
        if fields.clear_error {
            run.error = None;
        }
        if let Some(error) = fields.error {
            run.error = Some(error);
        }
        if let Some(hb) = fields.heartbeat_at {
            run.heartbeat_at = hb;
        }
        if let Some(idx) = fields.current_step_index {
            run.current_step_index = idx;
        }
        if let Some(progress) = fields.progress {
            run.progress = Some(progress);
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn delete_run(&self, id: &str) -> Result<(), DurablyError> {
        let mut state = self.state.lock().unwrap();
        state.runs.remove(id);
        state.steps.remove(id);
        state.logs.remove(id);
        state.insertion_order.retain(|x| x != id);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, DurablyError> {
        Ok(self.state.lock().unwrap().runs.get(id).cloned())
    }

    async fn get_runs(&self, filter: RunFilter) -> Result<Vec<Run>, DurablyError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<Run> = state
            .insertion_order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id))
            .filter(|r| filter.job_name.as_deref().map_or(true, |j| j == r.job_name))
            .filter(|r| filter.status.map_or(true, |s| s == r.status))
            .cloned()
            .collect();
        if let Some(offset) = filter.offset {
            runs = runs.into_iter().skip(offset.max(0) as usize).collect();
        }
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn get_next_pending_run(
        &self,
        exclude_concurrency_keys: &[String],
    ) -> Result<Option<Run>, DurablyError> {
        let state = self.state.lock().unwrap();
        let found = state
            .insertion_order
            .iter()
            .filter_map(|id| state.runs.get(id))
            .filter(|r| r.status == RunStatus::Pending)
            .find(|r| {
                r.concurrency_key
                    .as_ref()
                    .map_or(true, |k| !exclude_concurrency_keys.contains(k))
            })
            .cloned();
        Ok(found)
    }

    async fn create_step(
        &self,
        run_id: &str,
        name: &str,
        index: i64,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Step, DurablyError> {
        let mut state = self.state.lock().unwrap();
        let step = Step {
            id: new_id(),
            run_id: run_id.to_string(),
            name: name.to_string(),
            index,
            status,
            output,
            error,
            started_at,
            completed_at,
        };
        state
            .steps
            .entry(run_id.to_string())
            .or_default()
            .push(step.clone());
        Ok(step)
    }

    async fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, DurablyError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .steps
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_completed_step(
        &self,
        run_id: &str,
        name: &str,
    ) -> Result<Option<Step>, DurablyError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .steps
            .get(run_id)
            .and_then(|steps| {
                steps
                    .iter()
                    .find(|s| s.name == name && s.status == StepStatus::Completed)
                    .cloned()
            }))
    }

    async fn create_log(
        &self,
        run_id: &str,
        step_name: Option<String>,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<Log, DurablyError> {
        let mut state = self.state.lock().unwrap();
        let log = Log {
            id: new_id(),
            run_id: run_id.to_string(),
            step_name,
            level,
            message: message.to_string(),
            data,
            created_at: Utc::now(),
        };
        state
            .logs
            .entry(run_id.to_string())
            .or_default()
            .push(log.clone());
        Ok(log)
    }

    async fn get_logs(&self, run_id: &str) -> Result<Vec<Log>, DurablyError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_run_is_idempotent_by_key() {
        let storage = InMemoryStorage::new();
        let input = CreateRunInput {
            id: None,
            job_name: "job".to_string(),
            payload: Value::Null,
            idempotency_key: Some("abc".to_string()),
            concurrency_key: None,
        };
        let (first, created_first) = storage.create_run(input.clone()).await.unwrap();
        let (second, created_second) = storage.create_run(input).await.unwrap();
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn next_pending_run_skips_in_flight_concurrency_keys() {
        let storage = InMemoryStorage::new();
        storage
            .create_run(CreateRunInput {
                id: None,
                job_name: "job".to_string(),
                payload: Value::Null,
                idempotency_key: None,
                concurrency_key: Some("tenant-1".to_string()),
            })
            .await
            .unwrap();
        let next = storage
            .get_next_pending_run(&["tenant-1".to_string()])
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
