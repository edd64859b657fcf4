//! End-to-end scenarios against a real (in-memory) SQLite-backed engine:
//! happy path, step-level resume, idempotency, concurrency serialization,
//! stale recovery, and mid-run cancellation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use durably_core::{
    define_job, Durably, DurablyError, Event, EventKind, RunFilter, RunStatus, SerdeValidator,
    TriggerOptions, UpdateRunFields, WorkerConfig,
};
use durably_sqlite::SqliteStorage;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        polling_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        stale_threshold: Duration::from_secs(60),
    }
}

async fn fresh_storage() -> Arc<SqliteStorage> {
    let config = durably_sqlite::DbConfig {
        database_url: "sqlite::memory:".to_string(),
        max_connections: 1,
    };
    let storage = SqliteStorage::connect(&config).await.expect("connect");
    Arc::new(storage)
}

async fn wait_for_terminal(
    storage: &Arc<dyn durably_core::Storage>,
    run_id: &str,
) -> durably_core::Run {
    for _ in 0..200 {
        let run = storage.get_run(run_id).await.unwrap().expect("run exists");
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}

#[derive(Debug, Serialize, Deserialize)]
struct DoubleInput {
    n: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DoubleOutput {
    r: i64,
}

#[tokio::test]
async fn happy_path_doubles_n_through_one_step() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(storage.clone(), fast_worker_config());

    let handle = durably
        .register_job(
            "double",
            define_job(
                "double",
                SerdeValidator::<DoubleInput>::new(),
                Some(Arc::new(SerdeValidator::<DoubleOutput>::new())),
                |ctx, input: DoubleInput| async move {
                    let r = ctx
                        .run("x", || async move { Ok::<_, DurablyError>(input.n * 2) })
                        .await?;
                    Ok(DoubleOutput { r })
                },
            ),
        )
        .unwrap();
    durably.init().await.unwrap();

    let triggered = handle
        .trigger(DoubleInput { n: 21 }, TriggerOptions::default())
        .await
        .unwrap();
    let finished = wait_for_terminal(&storage, &triggered.id).await;

    assert_eq!(finished.status, RunStatus::Completed);
    let output: DoubleOutput = serde_json::from_value(finished.output.unwrap()).unwrap();
    assert_eq!(output, DoubleOutput { r: 42 });

    let steps = storage.get_steps(&triggered.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "x");
    assert_eq!(steps[0].status, durably_core::StepStatus::Completed);
    assert_eq!(steps[0].output, Some(serde_json::json!(42)));
}

#[derive(Debug, Serialize, Deserialize)]
struct FlakyInput {}

#[derive(Debug, Serialize, Deserialize)]
struct FlakyOutput {
    ok: bool,
}

#[tokio::test]
async fn step_level_resume_skips_the_already_completed_step() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(storage.clone(), fast_worker_config());

    let counter_a = Arc::new(AtomicI64::new(0));
    let counter_b = Arc::new(AtomicI64::new(0));
    let ca = counter_a.clone();
    let cb = counter_b.clone();

    let handle = durably
        .register_job(
            "flaky",
            define_job(
                "flaky",
                SerdeValidator::<FlakyInput>::new(),
                None,
                move |ctx, _input: FlakyInput| {
                    let ca = ca.clone();
                    let cb = cb.clone();
                    async move {
                        ctx.run("a", || {
                            let ca = ca.clone();
                            async move {
                                ca.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, DurablyError>(())
                            }
                        })
                        .await?;
                        ctx.run("b", || {
                            let cb = cb.clone();
                            let run_id = ctx.run_id().to_string();
                            async move {
                                let attempt = cb.fetch_add(1, Ordering::SeqCst) + 1;
                                if attempt == 1 {
                                    Err(DurablyError::StepFailed {
                                        run_id,
                                        step_name: "b".to_string(),
                                        message: "boom".to_string(),
                                    })
                                } else {
                                    Ok(())
                                }
                            }
                        })
                        .await?;
                        Ok(FlakyOutput { ok: true })
                    }
                },
            ),
        )
        .unwrap();
    durably.init().await.unwrap();

    let triggered = handle
        .trigger(FlakyInput {}, TriggerOptions::default())
        .await
        .unwrap();
    let failed = wait_for_terminal(&storage, &triggered.id).await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(counter_a.load(Ordering::SeqCst), 1);
    assert_eq!(counter_b.load(Ordering::SeqCst), 1);

    storage
        .update_run(
            &triggered.id,
            UpdateRunFields {
                status: Some(RunStatus::Pending),
                clear_error: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let completed = wait_for_terminal(&storage, &triggered.id).await;
    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(counter_a.load(Ordering::SeqCst), 1, "step a must not rerun");
    assert_eq!(counter_b.load(Ordering::SeqCst), 2);
}

#[derive(Debug, Serialize, Deserialize)]
struct OrgInput {
    org_id: String,
}

#[tokio::test]
async fn triggering_twice_with_the_same_idempotency_key_returns_one_run() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(storage.clone(), fast_worker_config());

    let handle = durably
        .register_job(
            "onboard",
            define_job(
                "onboard",
                SerdeValidator::<OrgInput>::new(),
                None,
                |_ctx, input: OrgInput| async move { Ok(input) },
            ),
        )
        .unwrap();

    let opts = || TriggerOptions {
        idempotency_key: Some("K".to_string()),
        concurrency_key: None,
    };
    let first = handle
        .trigger(
            OrgInput {
                org_id: "o".to_string(),
            },
            opts(),
        )
        .await
        .unwrap();
    let second = handle
        .trigger(
            OrgInput {
                org_id: "o".to_string(),
            },
            opts(),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let runs = storage
        .get_runs(RunFilter {
            job_name: Some("onboard".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkInput {}

#[tokio::test]
async fn runs_sharing_a_concurrency_key_never_interleave() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(storage.clone(), fast_worker_config());

    let handle = durably
        .register_job(
            "work",
            define_job(
                "work",
                SerdeValidator::<WorkInput>::new(),
                None,
                |ctx, _input: WorkInput| async move {
                    ctx.run("work", || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, DurablyError>(())
                    })
                    .await?;
                    Ok(WorkInput {})
                },
            ),
        )
        .unwrap();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_clone = log.clone();
    let _subscription = durably.events().on_any(move |event: &Event| {
        let entry = match &event.kind {
            EventKind::RunStart { run_id, .. } => Some(format!("start-{run_id}")),
            EventKind::RunComplete { run_id, .. } => Some(format!("end-{run_id}")),
            _ => None,
        };
        if let Some(entry) = entry {
            log_clone.lock().unwrap().push(entry);
        }
    });

    durably.init().await.unwrap();

    let opts = || TriggerOptions {
        idempotency_key: None,
        concurrency_key: Some("U".to_string()),
    };
    let first = handle.trigger(WorkInput {}, opts()).await.unwrap();
    // A few milliseconds apart so the two runs land in distinct
    // `created_at` buckets and `get_next_pending_run`'s ordering is
    // unambiguous.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = handle.trigger(WorkInput {}, opts()).await.unwrap();

    wait_for_terminal(&storage, &first.id).await;
    wait_for_terminal(&storage, &second.id).await;

    let entries = log.lock().unwrap().clone();
    let expected = vec![
        format!("start-{}", first.id),
        format!("end-{}", first.id),
        format!("start-{}", second.id),
        format!("end-{}", second.id),
    ];
    assert_eq!(entries, expected);
}

#[derive(Debug, Serialize, Deserialize)]
struct NoopInput {}

#[tokio::test]
async fn a_stale_running_row_is_reclaimed_and_completed() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(
        storage.clone(),
        WorkerConfig {
            polling_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_millis(50),
        },
    );

    durably
        .register_job(
            "noop",
            define_job(
                "noop",
                SerdeValidator::<NoopInput>::new(),
                None,
                |_ctx, input: NoopInput| async move { Ok(input) },
            ),
        )
        .unwrap();
    durably.storage().migrate().await.unwrap();

    let (run, _) = storage
        .create_run(durably_core::CreateRunInput {
            id: None,
            job_name: "noop".to_string(),
            payload: serde_json::json!({}),
            idempotency_key: None,
            concurrency_key: None,
        })
        .await
        .unwrap();
    storage
        .update_run(
            &run.id,
            UpdateRunFields {
                status: Some(RunStatus::Running),
                heartbeat_at: Some(chrono::Utc::now() - chrono::Duration::milliseconds(500)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    durably.init().await.unwrap();

    let finished = wait_for_terminal(&storage, &run.id).await;
    assert_eq!(finished.status, RunStatus::Completed);
}

#[derive(Debug, Serialize, Deserialize)]
struct ThreeStepInput {}

#[derive(Debug, Serialize, Deserialize)]
struct ThreeStepOutput {
    done: bool,
}

#[tokio::test]
async fn cancelling_mid_run_stops_before_the_next_step() {
    let storage: Arc<dyn durably_core::Storage> = fresh_storage().await;
    let durably = Durably::new(storage.clone(), fast_worker_config());

    let started = Arc::new(Notify::new());
    let started_clone = started.clone();

    let handle = durably
        .register_job(
            "three_step",
            define_job(
                "three_step",
                SerdeValidator::<ThreeStepInput>::new(),
                None,
                move |ctx, _input: ThreeStepInput| {
                    let started = started_clone.clone();
                    async move {
                        ctx.run("s1", || {
                            let started = started.clone();
                            async move {
                                started.notify_one();
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Ok::<_, DurablyError>(())
                            }
                        })
                        .await?;
                        ctx.run("s2", || async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, DurablyError>(())
                        })
                        .await?;
                        ctx.run("s3", || async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, DurablyError>(())
                        })
                        .await?;
                        Ok(ThreeStepOutput { done: true })
                    }
                },
            ),
        )
        .unwrap();
    durably.init().await.unwrap();

    let triggered = handle
        .trigger(ThreeStepInput {}, TriggerOptions::default())
        .await
        .unwrap();
    started.notified().await;
    durably.cancel(&triggered.id).await.unwrap();

    let finished = wait_for_terminal(&storage, &triggered.id).await;
    assert_eq!(finished.status, RunStatus::Cancelled);

    let steps = storage.get_steps(&triggered.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "s1");
    assert_eq!(steps[0].status, durably_core::StepStatus::Completed);
}
