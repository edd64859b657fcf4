//! Job definitions, registration, and the typed handle returned to callers.
//!
//! `In`/`Out` only exist at the edges: a `JobDefinition<In, Out>` is built
//! with concrete types, but the worker dispatches to jobs by name across a
//! registry that necessarily mixes many different `In`/`Out` pairs. The
//! `DynJob` trait is the type-erasure seam that makes that possible —
//! payloads cross it as `serde_json::Value`, validated on the way in and
//! (optionally) on the way out.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::error::DurablyError;
use crate::event::{Event, EventEmitter, EventKind, Subscription};
use crate::id::new_id;
use crate::model::Run;
use crate::step_context::StepContext;
use crate::storage::{CreateRunInput, RunFilter, Storage};
use crate::validation::Validator;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RunFn<In, Out> = Arc<dyn Fn(StepContext, In) -> BoxFuture<Result<Out, DurablyError>> + Send + Sync>;

/// A job's input schema, output schema, and body, before it is installed
/// into a registry.
pub struct JobDefinition<In, Out> {
    name: String,
    input: Arc<dyn Validator<In>>,
    output: Option<Arc<dyn Validator<Out>>>,
    run: RunFn<In, Out>,
}

impl<In, Out> Clone for JobDefinition<In, Out> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            run: self.run.clone(),
        }
    }
}

pub fn define_job<In, Out, F, Fut>(
    name: impl Into<String>,
    input: impl Validator<In> + 'static,
    output: Option<Arc<dyn Validator<Out>>>,
    run: F,
) -> JobDefinition<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
    F: Fn(StepContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, DurablyError>> + Send + 'static,
{
    JobDefinition {
        name: name.into(),
        input: Arc::new(input),
        output,
        run: Arc::new(move |ctx, input| Box::pin(run(ctx, input))),
    }
}

/// Type-erased entry point the worker dispatches through, keyed by job name.
#[async_trait]
pub(crate) trait DynJob: Send + Sync {
    fn name(&self) -> &str;
    fn validate_input(&self, raw: Value) -> Result<Value, DurablyError>;
    async fn run(&self, ctx: StepContext, payload: Value) -> Result<Value, DurablyError>;
    fn identity(&self) -> usize;
}

#[async_trait]
impl<In, Out> DynJob for JobDefinition<In, Out>
where
    In: DeserializeOwned + Serialize + Send + Sync + 'static,
    Out: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_input(&self, raw: Value) -> Result<Value, DurablyError> {
        let parsed = self.input.safe_parse(raw).map_err(|err| DurablyError::InvalidInput {
            job_name: self.name.clone(),
            message: err.message,
        })?;
        Ok(serde_json::to_value(parsed)?)
    }

    async fn run(&self, ctx: StepContext, payload: Value) -> Result<Value, DurablyError> {
        let run_id = ctx.run_id().to_string();
        let input: In = serde_json::from_value(payload).map_err(|err| DurablyError::InvalidInput {
            job_name: self.name.clone(),
            message: err.to_string(),
        })?;
        let output = (self.run)(ctx, input).await?;
        if let Some(validator) = &self.output {
            let raw = serde_json::to_value(&output)?;
            validator.safe_parse(raw).map_err(|err| DurablyError::InvalidOutput {
                run_id: run_id.clone(),
                message: err.message,
            })?;
        }
        Ok(serde_json::to_value(output)?)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.run) as *const () as usize
    }
}

/// Options accepted by `JobHandle::trigger`.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
}

/// Options accepted by `JobHandle::trigger_and_wait`.
#[derive(Debug, Clone)]
pub struct TriggerAndWaitOptions {
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub timeout: Duration,
}

impl Default for TriggerAndWaitOptions {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            concurrency_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A typed, per-job client: trigger runs, wait on them, and query their
/// history, scoped to this job's own name.
pub struct JobHandle<In, Out> {
    name: String,
    storage: Arc<dyn Storage>,
    emitter: EventEmitter,
    input: Arc<dyn Validator<In>>,
    _out: PhantomData<fn() -> Out>,
}

impl<In, Out> Clone for JobHandle<In, Out> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            storage: self.storage.clone(),
            emitter: self.emitter.clone(),
            input: self.input.clone(),
            _out: PhantomData,
        }
    }
}

impl<In, Out> JobHandle<In, Out>
where
    In: Serialize + Send + Sync,
    Out: DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &In) -> Result<Value, DurablyError> {
        let raw = serde_json::to_value(input)?;
        let validated = self.input.safe_parse(raw).map_err(|err| DurablyError::InvalidInput {
            job_name: self.name.clone(),
            message: err.message,
        })?;
        Ok(serde_json::to_value(validated)?)
    }

    pub async fn trigger(&self, input: In, opts: TriggerOptions) -> Result<Run, DurablyError> {
        let payload = self.validate(&input)?;
        let id = new_id();
        let (run, created) = self
            .storage
            .create_run(CreateRunInput {
                id: Some(id),
                job_name: self.name.clone(),
                payload: payload.clone(),
                idempotency_key: opts.idempotency_key,
                concurrency_key: opts.concurrency_key,
            })
            .await?;
        if created {
            self.emitter.emit(EventKind::RunTrigger {
                run_id: run.id.clone(),
                job_name: self.name.clone(),
                payload: Some(payload),
            });
        }
        Ok(run)
    }

    fn watch_run(&self, run_id: String) -> (Subscription, oneshot::Receiver<Result<Value, String>>) {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let subscription = self.emitter.on_run(run_id, move |event: &Event| {
            let outcome = match &event.kind {
                EventKind::RunComplete { output, .. } => Some(Ok(output.clone())),
                EventKind::RunFail { error, .. } => Some(Err(error.clone())),
                _ => None,
            };
            if let Some(outcome) = outcome {
                if let Some(sender) = tx.lock().unwrap().take() {
                    let _ = sender.send(outcome);
                }
            }
        });
        (subscription, rx)
    }

    pub async fn trigger_and_wait(
        &self,
        input: In,
        opts: TriggerAndWaitOptions,
    ) -> Result<Out, DurablyError> {
        let payload = self.validate(&input)?;
        let id = new_id();

        // Subscribed before the run is created: a run that completes between
        // `create_run` returning and the subscription existing would
        // otherwise be missed entirely.
        let (mut subscription, mut rx) = self.watch_run(id.clone());

        let (run, created) = self
            .storage
            .create_run(CreateRunInput {
                id: Some(id.clone()),
                job_name: self.name.clone(),
                payload: payload.clone(),
                idempotency_key: opts.idempotency_key,
                concurrency_key: opts.concurrency_key,
            })
            .await?;
        if created {
            self.emitter.emit(EventKind::RunTrigger {
                run_id: run.id.clone(),
                job_name: self.name.clone(),
                payload: Some(payload),
            });
        } else if run.status.is_terminal() {
            // Raced an already-finished run created under the same
            // idempotency key before we subscribed to its id; resolve from
            // the row directly instead of waiting for an event.
            return self.resolve_existing(&run);
        } else if run.id != id {
            // An existing, still pending/running row under the same
            // idempotency key, keyed by an id we never subscribed to. Rewire
            // the wait onto its real id, then re-check the row in case it
            // finished between `create_run` returning and the new
            // subscription existing.
            let (real_subscription, real_rx) = self.watch_run(run.id.clone());
            subscription = real_subscription;
            rx = real_rx;
            if let Some(latest) = self.storage.get_run(&run.id).await? {
                if latest.status.is_terminal() {
                    return self.resolve_existing(&latest);
                }
            }
        }

        let _subscription = subscription;
        match tokio::time::timeout(opts.timeout, rx).await {
            Ok(Ok(Ok(output))) => Ok(serde_json::from_value(output)?),
            Ok(Ok(Err(error))) => Err(DurablyError::StepFailed {
                run_id: id,
                step_name: "unknown".to_string(),
                message: error,
            }),
            Ok(Err(_)) | Err(_) => Err(DurablyError::Timeout { run_id: id }),
        }
    }

    fn resolve_existing(&self, run: &Run) -> Result<Out, DurablyError> {
        match run.status {
            crate::model::RunStatus::Completed => {
                let output = run.output.clone().unwrap_or(Value::Null);
                Ok(serde_json::from_value(output)?)
            }
            _ => Err(DurablyError::StepFailed {
                run_id: run.id.clone(),
                step_name: "unknown".to_string(),
                message: run.error.clone().unwrap_or_default(),
            }),
        }
    }

    pub async fn batch_trigger(
        &self,
        inputs: Vec<(In, TriggerOptions)>,
    ) -> Result<Vec<Run>, DurablyError> {
        let mut create_inputs = Vec::with_capacity(inputs.len());
        for (input, opts) in inputs {
            let payload = self.validate(&input)?;
            create_inputs.push(CreateRunInput {
                id: Some(new_id()),
                job_name: self.name.clone(),
                payload,
                idempotency_key: opts.idempotency_key,
                concurrency_key: opts.concurrency_key,
            });
        }
        let created = self.storage.batch_create_runs(create_inputs).await?;
        let mut runs = Vec::with_capacity(created.len());
        for (run, was_created) in created {
            if was_created {
                self.emitter.emit(EventKind::RunTrigger {
                    run_id: run.id.clone(),
                    job_name: self.name.clone(),
                    payload: Some(run.payload.clone()),
                });
            }
            runs.push(run);
        }
        Ok(runs)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, DurablyError> {
        match self.storage.get_run(run_id).await? {
            Some(run) if run.job_name == self.name => Ok(Some(run)),
            _ => Ok(None),
        }
    }

    pub async fn get_runs(&self, mut filter: RunFilter) -> Result<Vec<Run>, DurablyError> {
        filter.job_name = Some(self.name.clone());
        self.storage.get_runs(filter).await
    }
}

struct RegisteredJob {
    job: Arc<dyn DynJob>,
    identity: usize,
}

/// Shared, type-erased table of every job installed into a `Durably`
/// instance. The worker reads from it; `Durably::register_job` writes to
/// it and hands back a typed `JobHandle`.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, RegisteredJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Installs `definition` under `name` and returns a typed handle to it.
    /// Re-registering the exact same definition under a name already in use
    /// is idempotent; registering a different definition under an
    /// in-use name is a conflict.
    pub fn register<In, Out>(
        &self,
        name: impl Into<String>,
        definition: JobDefinition<In, Out>,
        storage: Arc<dyn Storage>,
        emitter: EventEmitter,
    ) -> Result<JobHandle<In, Out>, DurablyError>
    where
        In: DeserializeOwned + Serialize + Send + Sync + 'static,
        Out: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        let name = name.into();
        let identity = Arc::as_ptr(&definition.run) as *const () as usize;
        let input = definition.input.clone();

        {
            let mut jobs = self.jobs.write().unwrap();
            match jobs.get(&name) {
                Some(existing) if existing.identity == identity => {}
                Some(_) => {
                    return Err(DurablyError::JobConflict { name });
                }
                None => {
                    jobs.insert(
                        name.clone(),
                        RegisteredJob {
                            job: Arc::new(definition),
                            identity,
                        },
                    );
                }
            }
        }

        Ok(JobHandle {
            name,
            storage,
            emitter,
            input,
            _out: PhantomData,
        })
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn DynJob>> {
        self.jobs.read().unwrap().get(name).map(|r| r.job.clone())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().unwrap().keys().cloned().collect()
    }

    /// Triggers a run by job name for callers that don't have a typed
    /// `JobHandle` at hand, such as the HTTP `POST /trigger` route.
    pub async fn trigger_by_name(
        &self,
        name: &str,
        storage: &Arc<dyn Storage>,
        emitter: &EventEmitter,
        payload: Value,
        opts: TriggerOptions,
    ) -> Result<Run, DurablyError> {
        let job = self
            .get(name)
            .ok_or_else(|| DurablyError::UnknownJob(name.to_string()))?;
        trigger_dynamic(&job, storage, emitter, payload, opts).await
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Triggers a run by job name without requiring a typed `JobHandle`, for
/// callers (the HTTP surface) that only have a raw JSON payload and a job
/// name at hand.
async fn trigger_dynamic(
    job: &Arc<dyn DynJob>,
    storage: &Arc<dyn Storage>,
    emitter: &EventEmitter,
    payload: Value,
    opts: TriggerOptions,
) -> Result<Run, DurablyError> {
    let validated = job.validate_input(payload)?;
    let id = new_id();
    let (run, created) = storage
        .create_run(CreateRunInput {
            id: Some(id),
            job_name: job.name().to_string(),
            payload: validated.clone(),
            idempotency_key: opts.idempotency_key,
            concurrency_key: opts.concurrency_key,
        })
        .await?;
    if created {
        emitter.emit(EventKind::RunTrigger {
            run_id: run.id.clone(),
            job_name: job.name().to_string(),
            payload: Some(validated),
        });
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::validation::SerdeValidator;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DoubleInput {
        value: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct DoubleOutput {
        doubled: i64,
    }

    fn double_job() -> JobDefinition<DoubleInput, DoubleOutput> {
        define_job(
            "double",
            SerdeValidator::<DoubleInput>::new(),
            None,
            |_ctx, input: DoubleInput| async move {
                Ok(DoubleOutput {
                    doubled: input.value * 2,
                })
            },
        )
    }

    #[tokio::test]
    async fn register_is_idempotent_for_the_same_definition() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let def = double_job();
        let handle1 = registry
            .register("double", def.clone(), storage.clone(), emitter.clone())
            .unwrap();
        let handle2 = registry
            .register("double", def, storage, emitter)
            .unwrap();
        assert_eq!(handle1.name(), handle2.name());
    }

    #[tokio::test]
    async fn register_conflicts_on_distinct_definitions_same_name() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        registry
            .register("double", double_job(), storage.clone(), emitter.clone())
            .unwrap();
        let err = registry
            .register("double", double_job(), storage, emitter)
            .unwrap_err();
        assert!(matches!(err, DurablyError::JobConflict { .. }));
    }

    #[tokio::test]
    async fn trigger_persists_a_pending_run_and_emits_once() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let handle = registry
            .register("double", double_job(), storage.clone(), emitter)
            .unwrap();

        let run = handle
            .trigger(DoubleInput { value: 5 }, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(run.job_name, "double");
        assert_eq!(run.status, crate::model::RunStatus::Pending);
    }

    #[tokio::test]
    async fn trigger_and_wait_resolves_on_run_complete() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let handle = registry
            .register("double", double_job(), storage.clone(), emitter.clone())
            .unwrap();

        let handle_clone = handle.clone();
        let waiter = tokio::spawn(async move {
            handle_clone
                .trigger_and_wait(
                    DoubleInput { value: 4 },
                    TriggerAndWaitOptions {
                        timeout: Duration::from_secs(1),
                        ..Default::default()
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let runs = storage.get_runs(RunFilter::default()).await.unwrap();
        let run_id = runs[0].id.clone();
        emitter.emit(EventKind::RunComplete {
            run_id,
            job_name: "double".to_string(),
            output: serde_json::to_value(DoubleOutput { doubled: 8 }).unwrap(),
            duration_ms: 1,
        });

        let output = waiter.await.unwrap().unwrap();
        assert_eq!(output, DoubleOutput { doubled: 8 });
    }

    #[tokio::test]
    async fn trigger_and_wait_resolves_existing_terminal_duplicate_without_waiting() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let handle = registry
            .register("double", double_job(), storage.clone(), emitter)
            .unwrap();

        let (existing, _created) = storage
            .create_run(CreateRunInput {
                id: None,
                job_name: "double".to_string(),
                payload: serde_json::to_value(DoubleInput { value: 3 }).unwrap(),
                idempotency_key: Some("dup".to_string()),
                concurrency_key: None,
            })
            .await
            .unwrap();
        storage
            .update_run(
                &existing.id,
                crate::storage::UpdateRunFields {
                    status: Some(crate::model::RunStatus::Completed),
                    output: Some(serde_json::to_value(DoubleOutput { doubled: 6 }).unwrap()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let output = handle
            .trigger_and_wait(
                DoubleInput { value: 3 },
                TriggerAndWaitOptions {
                    idempotency_key: Some("dup".to_string()),
                    timeout: Duration::from_millis(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(output, DoubleOutput { doubled: 6 });
    }

    /// Regression test for a race where `create_run` returns an existing,
    /// still-pending row under a matching idempotency key: the caller must
    /// end up waiting on that row's real id, not the id it pre-minted for
    /// itself before discovering the duplicate.
    #[tokio::test]
    async fn trigger_and_wait_rewires_subscription_for_non_terminal_duplicate() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let handle = registry
            .register("double", double_job(), storage.clone(), emitter.clone())
            .unwrap();

        let (existing, _created) = storage
            .create_run(CreateRunInput {
                id: None,
                job_name: "double".to_string(),
                payload: serde_json::to_value(DoubleInput { value: 7 }).unwrap(),
                idempotency_key: Some("pending-dup".to_string()),
                concurrency_key: None,
            })
            .await
            .unwrap();
        assert_eq!(existing.status, crate::model::RunStatus::Pending);

        let handle_clone = handle.clone();
        let waiter = tokio::spawn(async move {
            handle_clone
                .trigger_and_wait(
                    DoubleInput { value: 7 },
                    TriggerAndWaitOptions {
                        idempotency_key: Some("pending-dup".to_string()),
                        timeout: Duration::from_secs(1),
                        ..Default::default()
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        emitter.emit(EventKind::RunComplete {
            run_id: existing.id.clone(),
            job_name: "double".to_string(),
            output: serde_json::to_value(DoubleOutput { doubled: 14 }).unwrap(),
            duration_ms: 1,
        });

        let output = waiter.await.unwrap().unwrap();
        assert_eq!(output, DoubleOutput { doubled: 14 });
    }

    #[tokio::test]
    async fn batch_trigger_emits_only_for_newly_created_runs() {
        let registry = JobRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let emitter = EventEmitter::new();
        let handle = registry
            .register("double", double_job(), storage.clone(), emitter.clone())
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen_clone = seen.clone();
        let _sub = emitter.on_kind("run:trigger", move |_event| {
            *seen_clone.lock().unwrap() += 1;
        });

        let runs = handle
            .batch_trigger(vec![
                (
                    DoubleInput { value: 1 },
                    TriggerOptions {
                        idempotency_key: Some("batch-dup".to_string()),
                        concurrency_key: None,
                    },
                ),
                (
                    DoubleInput { value: 1 },
                    TriggerOptions {
                        idempotency_key: Some("batch-dup".to_string()),
                        concurrency_key: None,
                    },
                ),
            ])
            .await
            .unwrap();

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, runs[1].id);
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
