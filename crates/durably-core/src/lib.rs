//! Core engine for the resumable, step-oriented job execution system:
//! job definitions, the event-sourced pub/sub bus, the storage seam, the
//! step-replay context, and the single-worker polling loop. Backends (e.g.
//! `durably-sqlite`) implement `Storage`; front ends (e.g. `durably-http`)
//! drive a `Durably` instance built on top of one.

pub mod error;
pub mod event;
pub mod facade;
pub mod id;
pub mod job;
pub mod model;
pub mod step_context;
pub mod storage;
pub mod validation;
mod worker;

pub use error::DurablyError;
pub use event::{Event, EventEmitter, EventKind, Subscription};
pub use facade::{Durably, RunEventStream};
pub use job::{
    define_job, JobDefinition, JobHandle, JobRegistry, TriggerAndWaitOptions, TriggerOptions,
};
pub use model::{Log, LogLevel, Progress, Run, RunStatus, Step, StepStatus};
pub use step_context::StepContext;
pub use storage::{CreateRunInput, InMemoryStorage, RunFilter, Storage, UpdateRunFields};
pub use validation::{FnValidator, SerdeValidator, ValidationError, Validator};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
