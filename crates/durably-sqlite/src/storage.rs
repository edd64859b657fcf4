//! The one concrete `Storage` implementation, backed by `sqlx`'s SQLite
//! driver. Filter-shaped queries (`get_runs`, `get_next_pending_run`) are
//! built with `sqlx::QueryBuilder` rather than hand-concatenated SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use durably_core::{
    CreateRunInput, DurablyError, Log, LogLevel, Progress, Run, RunFilter, RunStatus, Step,
    StepStatus, Storage, UpdateRunFields,
};

use crate::config::DbConfig;
use crate::error::map_sqlx_error;
use crate::migrations::run_migrations;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(config: &DbConfig) -> Result<Self, DurablyError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    job_name: String,
    payload: String,
    status: String,
    idempotency_key: Option<String>,
    concurrency_key: Option<String>,
    current_step_index: i64,
    progress: Option<String>,
    output: Option<String>,
    error: Option<String>,
    heartbeat_at: String,
    created_at: String,
    updated_at: String,
}

#[derive(FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    name: String,
    step_index: i64,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

#[derive(FromRow)]
struct LogRow {
    id: String,
    run_id: String,
    step_name: Option<String>,
    level: String,
    message: String,
    data: Option<String>,
    created_at: String,
}

fn parse_status(raw: &str) -> Result<RunStatus, DurablyError> {
    match raw {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(DurablyError::storage(format!("unknown run status `{other}`"))),
    }
}

fn parse_step_status(raw: &str) -> Result<StepStatus, DurablyError> {
    match raw {
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        other => Err(DurablyError::storage(format!("unknown step status `{other}`"))),
    }
}

fn parse_log_level(raw: &str) -> Result<LogLevel, DurablyError> {
    match raw {
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(DurablyError::storage(format!("unknown log level `{other}`"))),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DurablyError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| DurablyError::storage(format!("invalid timestamp `{raw}`: {err}")))
}

fn parse_json(raw: &str) -> Result<Value, DurablyError> {
    serde_json::from_str(raw).map_err(DurablyError::from)
}

impl TryFrom<RunRow> for Run {
    type Error = DurablyError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            job_name: row.job_name,
            payload: parse_json(&row.payload)?,
            status: parse_status(&row.status)?,
            idempotency_key: row.idempotency_key,
            concurrency_key: row.concurrency_key,
            current_step_index: row.current_step_index,
            progress: row
                .progress
                .map(|p| serde_json::from_str::<Progress>(&p))
                .transpose()?,
            output: row.output.map(|o| parse_json(&o)).transpose()?,
            error: row.error,
            heartbeat_at: parse_timestamp(&row.heartbeat_at)?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

impl TryFrom<StepRow> for Step {
    type Error = DurablyError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            index: row.step_index,
            status: parse_step_status(&row.status)?,
            output: row.output.map(|o| parse_json(&o)).transpose()?,
            error: row.error,
            started_at: parse_timestamp(&row.started_at)?,
            completed_at: row.completed_at.map(|c| parse_timestamp(&c)).transpose()?,
        })
    }
}

impl TryFrom<LogRow> for Log {
    type Error = DurablyError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(Log {
            id: row.id,
            run_id: row.run_id,
            step_name: row.step_name,
            level: parse_log_level(&row.level)?,
            message: row.message,
            data: row.data.map(|d| parse_json(&d)).transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn migrate(&self) -> Result<(), DurablyError> {
        run_migrations(&self.pool).await
    }

    async fn create_run(&self, input: CreateRunInput) -> Result<(Run, bool), DurablyError> {
        if let Some(key) = &input.idempotency_key {
            let existing: Option<RunRow> = sqlx::query_as(
                "SELECT * FROM durably_runs WHERE job_name = ? AND idempotency_key = ?",
            )
            .bind(&input.job_name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            if let Some(row) = existing {
                return Ok((row.try_into()?, false));
            }
        }

        let now = Utc::now();
        let id = input.id.unwrap_or_else(durably_core::id::new_id);
        let payload = serde_json::to_string(&input.payload)?;
        let now_str = now.to_rfc3339();

        sqlx::query(
            "INSERT INTO durably_runs
                (id, job_name, payload, status, idempotency_key, concurrency_key,
                 current_step_index, progress, output, error, heartbeat_at, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, ?, 0, NULL, NULL, NULL, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&input.job_name)
        .bind(&payload)
        .bind(&input.idempotency_key)
        .bind(&input.concurrency_key)
        .bind(&now_str)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok((
            Run {
                id,
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
            },
            true,
        ))
    }

    async fn batch_create_runs(
        &self,
        inputs: Vec<CreateRunInput>,
    ) -> Result<Vec<(Run, bool)>, DurablyError> {
        // One transaction for the whole batch: either every non-duplicate
        // input becomes a row, or (on any error) none does. Duplicated here
        // rather than calling `create_run`, since each lookup/insert pair
        // must run against the same `tx`, not a fresh pool connection.
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut results = Vec::with_capacity(inputs.len());

        for input in inputs {
            if let Some(key) = &input.idempotency_key {
                let existing: Option<RunRow> = sqlx::query_as(
                    "SELECT * FROM durably_runs WHERE job_name = ? AND idempotency_key = ?",
                )
                .bind(&input.job_name)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
                if let Some(row) = existing {
                    results.push((row.try_into()?, false));
                    continue;
                }
            }

            let now = Utc::now();
            let id = input.id.clone().unwrap_or_else(durably_core::id::new_id);
            let payload = serde_json::to_string(&input.payload)?;
            let now_str = now.to_rfc3339();

            sqlx::query(
                "INSERT INTO durably_runs
                    (id, job_name, payload, status, idempotency_key, concurrency_key,
                     current_step_index, progress, output, error, heartbeat_at, created_at, updated_at)
                 VALUES (?, ?, ?, 'pending', ?, ?, 0, NULL, NULL, NULL, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&input.job_name)
            .bind(&payload)
            .bind(&input.idempotency_key)
            .bind(&input.concurrency_key)
            .bind(&now_str)
            .bind(&now_str)
            .bind(&now_str)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            results.push((
                Run {
                    id,
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
                },
                true,
            ));
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(results)
    }

    async fn update_run(&self, id: &str, fields: UpdateRunFields) -> Result<Run, DurablyError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE durably_runs SET ");
        let mut separated = builder.separated(", ");

        if let Some(status) = fields.status {
            separated.push("status = ");
            separated.push_bind_unseparated(status.as_str());
        }
        if let Some(output) = &fields.output {
            let serialized = serde_json::to_string(output)?;
            separated.push("output = ");
            separated.push_bind_unseparated(serialized);
        }
        if fields.clear_error {
            separated.push("error = NULL");
        }
        if let Some(error) = &fields.error {
            separated.push("error = ");
            separated.push_bind_unseparated(error.clone());
        }
        if let Some(hb) = fields.heartbeat_at {
            separated.push("heartbeat_at = ");
            separated.push_bind_unseparated(hb.to_rfc3339());
        }
        if let Some(idx) = fields.current_step_index {
            separated.push("current_step_index = ");
            separated.push_bind_unseparated(idx);
        }
        if let Some(progress) = &fields.progress {
            let serialized = serde_json::to_string(progress)?;
            separated.push("progress = ");
            separated.push_bind_unseparated(serialized);
        }
        separated.push("updated_at = ");
        separated.push_bind_unseparated(Utc::now().to_rfc3339());

        builder.push(" WHERE id = ");
        builder.push_bind(id.to_string());

        let result = builder.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(DurablyError::RunNotFound {
                run_id: id.to_string(),
            });
        }

        self.get_run(id)
            .await?
            .ok_or_else(|| DurablyError::RunNotFound {
                run_id: id.to_string(),
            })
    }

    async fn delete_run(&self, id: &str) -> Result<(), DurablyError> {
        sqlx::query("DELETE FROM durably_runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, DurablyError> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM durably_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(Run::try_from).transpose()
    }

    async fn get_runs(&self, filter: RunFilter) -> Result<Vec<Run>, DurablyError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM durably_runs");
        let mut has_where = false;

        if let Some(job_name) = &filter.job_name {
            builder.push(" WHERE job_name = ");
            builder.push_bind(job_name.clone());
            has_where = true;
        }
        if let Some(status) = filter.status {
            builder.push(if has_where { " AND status = " } else { " WHERE status = " });
            builder.push_bind(status.as_str());
        }

        builder.push(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let rows: Vec<RunRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Run::try_from).collect()
    }

    async fn get_next_pending_run(
        &self,
        exclude_concurrency_keys: &[String],
    ) -> Result<Option<Run>, DurablyError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM durably_runs WHERE status = 'pending'");

        if !exclude_concurrency_keys.is_empty() {
            builder.push(" AND (concurrency_key IS NULL OR concurrency_key NOT IN (");
            let mut separated = builder.separated(", ");
            for key in exclude_concurrency_keys {
                separated.push_bind(key.clone());
            }
            builder.push("))");
        }

        builder.push(" ORDER BY created_at ASC LIMIT 1");

        let row: Option<RunRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(Run::try_from).transpose()
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
        let id = durably_core::id::new_id();
        let status_str = match status {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        let output_str = output.as_ref().map(serde_json::to_string).transpose()?;
        let started_at_str = started_at.to_rfc3339();
        let completed_at_str = completed_at.map(|c| c.to_rfc3339());

        sqlx::query(
            "INSERT INTO durably_steps
                (id, run_id, name, step_index, status, output, error, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(run_id)
        .bind(name)
        .bind(index)
        .bind(status_str)
        .bind(&output_str)
        .bind(&error)
        .bind(&started_at_str)
        .bind(&completed_at_str)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Step {
            id,
            run_id: run_id.to_string(),
            name: name.to_string(),
            index,
            status,
            output,
            error,
            started_at,
            completed_at,
        })
    }

    async fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, DurablyError> {
        let rows: Vec<StepRow> =
            sqlx::query_as("SELECT * FROM durably_steps WHERE run_id = ? ORDER BY step_index ASC")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.into_iter().map(Step::try_from).collect()
    }

    async fn get_completed_step(
        &self,
        run_id: &str,
        name: &str,
    ) -> Result<Option<Step>, DurablyError> {
        let row: Option<StepRow> = sqlx::query_as(
            "SELECT * FROM durably_steps WHERE run_id = ? AND name = ? AND status = 'completed'
             ORDER BY step_index ASC LIMIT 1",
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(Step::try_from).transpose()
    }

    async fn create_log(
        &self,
        run_id: &str,
        step_name: Option<String>,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<Log, DurablyError> {
        let id = durably_core::id::new_id();
        let level_str = level.as_str();
        let data_str = data.as_ref().map(serde_json::to_string).transpose()?;
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO durably_logs (id, run_id, step_name, level, message, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(run_id)
        .bind(&step_name)
        .bind(level_str)
        .bind(message)
        .bind(&data_str)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Log {
            id,
            run_id: run_id.to_string(),
            step_name,
            level,
            message: message.to_string(),
            data,
            created_at,
        })
    }

    async fn get_logs(&self, run_id: &str) -> Result<Vec<Log>, DurablyError> {
        let rows: Vec<LogRow> =
            sqlx::query_as("SELECT * FROM durably_logs WHERE run_id = ? ORDER BY created_at ASC")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        rows.into_iter().map(Log::try_from).collect()
    }
}
