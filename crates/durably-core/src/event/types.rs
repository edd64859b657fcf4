//! Event envelope and the fixed set of event kinds the emitter can carry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::model::{LogLevel, Progress};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename = "run:trigger")]
    RunTrigger {
        run_id: String,
        job_name: String,
        payload: Option<Value>,
    },
    #[serde(rename = "run:start")]
    RunStart {
        run_id: String,
        job_name: String,
        payload: Value,
    },
    #[serde(rename = "run:complete")]
    RunComplete {
        run_id: String,
        job_name: String,
        output: Value,
        duration_ms: i64,
    },
    #[serde(rename = "run:fail")]
    RunFail {
        run_id: String,
        job_name: String,
        error: String,
        failed_step_name: String,
    },
    #[serde(rename = "run:cancel")]
    RunCancel { run_id: String, job_name: String },
    #[serde(rename = "run:retry")]
    RunRetry { run_id: String, job_name: String },
    #[serde(rename = "run:progress")]
    RunProgress {
        run_id: String,
        job_name: String,
        progress: Progress,
    },
    #[serde(rename = "step:start")]
    StepStart {
        run_id: String,
        job_name: String,
        step_name: String,
        step_index: i64,
    },
    #[serde(rename = "step:complete")]
    StepComplete {
        run_id: String,
        job_name: String,
        step_name: String,
        step_index: i64,
        output: Value,
        duration_ms: i64,
    },
    #[serde(rename = "step:fail")]
    StepFail {
        run_id: String,
        job_name: String,
        step_name: String,
        step_index: i64,
        error: String,
    },
    #[serde(rename = "log:write")]
    LogWrite {
        run_id: String,
        step_name: Option<String>,
        level: LogLevel,
        message: String,
        data: Option<Value>,
    },
    #[serde(rename = "worker:error")]
    WorkerError { message: String },
}

impl EventKind {
    /// The discriminant used for type-scoped subscriptions, e.g. `"run:complete"`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventKind::RunTrigger { .. } => "run:trigger",
            EventKind::RunStart { .. } => "run:start",
            EventKind::RunComplete { .. } => "run:complete",
            EventKind::RunFail { .. } => "run:fail",
            EventKind::RunCancel { .. } => "run:cancel",
            EventKind::RunRetry { .. } => "run:retry",
            EventKind::RunProgress { .. } => "run:progress",
            EventKind::StepStart { .. } => "step:start",
            EventKind::StepComplete { .. } => "step:complete",
            EventKind::StepFail { .. } => "step:fail",
            EventKind::LogWrite { .. } => "log:write",
            EventKind::WorkerError { .. } => "worker:error",
        }
    }

    /// The run this event belongs to, if any. `worker:error` is process-scoped.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            EventKind::RunTrigger { run_id, .. }
            | EventKind::RunStart { run_id, .. }
            | EventKind::RunComplete { run_id, .. }
            | EventKind::RunFail { run_id, .. }
            | EventKind::RunCancel { run_id, .. }
            | EventKind::RunRetry { run_id, .. }
            | EventKind::RunProgress { run_id, .. }
            | EventKind::StepStart { run_id, .. }
            | EventKind::StepComplete { run_id, .. }
            | EventKind::StepFail { run_id, .. }
            | EventKind::LogWrite { run_id, .. } => Some(run_id),
            EventKind::WorkerError { .. } => None,
        }
    }

    /// The job this event belongs to, if any. `log:write` carries no
    /// `job_name` of its own and `worker:error` is process-scoped.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            EventKind::RunTrigger { job_name, .. }
            | EventKind::RunStart { job_name, .. }
            | EventKind::RunComplete { job_name, .. }
            | EventKind::RunFail { job_name, .. }
            | EventKind::RunCancel { job_name, .. }
            | EventKind::RunRetry { job_name, .. }
            | EventKind::RunProgress { job_name, .. }
            | EventKind::StepStart { job_name, .. }
            | EventKind::StepComplete { job_name, .. }
            | EventKind::StepFail { job_name, .. } => Some(job_name),
            EventKind::LogWrite { .. } | EventKind::WorkerError { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn run_id(&self) -> Option<&str> {
        self.kind.run_id()
    }

    pub fn job_name(&self) -> Option<&str> {
        self.kind.job_name()
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.kind_name()
    }
}
