//! HTTP handlers: a thin adapter over `Durably`, one route per facade
//! operation, with JSON request/response bodies in camelCase to match the
//! wire contract the engine's job payloads already use.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use durably_core::{Durably, DurablyError, RunFilter, RunStatus, TriggerOptions};

use crate::sse::to_sse;

pub type AppState = Arc<Durably>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/trigger", post(trigger))
        .route("/subscribe", get(subscribe))
        .route("/runs", get(list_runs))
        .route("/run", get(get_run).delete(delete_run))
        .route("/steps", get(get_steps))
        .route("/retry", post(retry))
        .route("/cancel", post(cancel))
        .route("/runs/subscribe", get(subscribe_all))
        .with_state(state)
}

pub struct AppError(DurablyError);

impl From<DurablyError> for AppError {
    fn from(err: DurablyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DurablyError::UnknownJob(_) | DurablyError::RunNotFound { .. } => StatusCode::NOT_FOUND,
            DurablyError::InvalidInput { .. } | DurablyError::InvalidOutput { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    job_name: String,
    input: Value,
    idempotency_key: Option<String>,
    concurrency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    run_id: String,
}

async fn trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    let run = state
        .registry()
        .trigger_by_name(
            &req.job_name,
            state.storage(),
            state.events(),
            req.input,
            TriggerOptions {
                idempotency_key: req.idempotency_key,
                concurrency_key: req.concurrency_key,
            },
        )
        .await?;
    Ok(Json(TriggerResponse { run_id: run.id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIdQuery {
    run_id: String,
}

async fn subscribe(State(state): State<AppState>, Query(query): Query<RunIdQuery>) -> impl IntoResponse {
    to_sse(state.subscribe(query.run_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAllQuery {
    job_name: Option<String>,
}

async fn subscribe_all(
    State(state): State<AppState>,
    Query(query): Query<SubscribeAllQuery>,
) -> impl IntoResponse {
    to_sse(state.subscribe_all(query.job_name))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunsQuery {
    job_name: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<durably_core::Run>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(|message| AppError(DurablyError::InvalidInput {
            job_name: "runs".to_string(),
            message,
        }))?;
    let runs = state
        .storage()
        .get_runs(RunFilter {
            job_name: query.job_name,
            status,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(runs))
}

fn parse_status(raw: &str) -> Result<RunStatus, String> {
    match raw {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(format!("unknown status `{other}`")),
    }
}

async fn get_run(
    State(state): State<AppState>,
    Query(query): Query<RunIdQuery>,
) -> Result<Json<durably_core::Run>, AppError> {
    let run = state
        .storage()
        .get_run(&query.run_id)
        .await?
        .ok_or_else(|| DurablyError::RunNotFound {
            run_id: query.run_id.clone(),
        })?;
    Ok(Json(run))
}

async fn get_steps(
    State(state): State<AppState>,
    Query(query): Query<RunIdQuery>,
) -> Result<Json<Vec<durably_core::Step>>, AppError> {
    let steps = state.storage().get_steps(&query.run_id).await?;
    Ok(Json(steps))
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn retry(
    State(state): State<AppState>,
    Query(query): Query<RunIdQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.retry(&query.run_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn cancel(
    State(state): State<AppState>,
    Query(query): Query<RunIdQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.cancel(&query.run_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn delete_run(
    State(state): State<AppState>,
    Query(query): Query<RunIdQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.delete_run(&query.run_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_query_accepts_camel_case_run_id() {
        let query: RunIdQuery = serde_json::from_value(json!({ "runId": "abc123" })).unwrap();
        assert_eq!(query.run_id, "abc123");
    }

    #[test]
    fn subscribe_all_query_accepts_camel_case_job_name() {
        let query: SubscribeAllQuery =
            serde_json::from_value(json!({ "jobName": "send-email" })).unwrap();
        assert_eq!(query.job_name.as_deref(), Some("send-email"));
    }

    #[test]
    fn subscribe_all_query_job_name_is_optional() {
        let query: SubscribeAllQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(query.job_name, None);
    }

    #[test]
    fn runs_query_accepts_camel_case_job_name() {
        let query: RunsQuery = serde_json::from_value(json!({
            "jobName": "send-email",
            "status": "pending",
            "limit": 10,
            "offset": 0
        }))
        .unwrap();
        assert_eq!(query.job_name.as_deref(), Some("send-email"));
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn trigger_request_accepts_camel_case_idempotency_key() {
        let req: TriggerRequest = serde_json::from_value(json!({
            "jobName": "send-email",
            "input": {},
            "idempotencyKey": "key-1"
        }))
        .unwrap();
        assert_eq!(req.job_name, "send-email");
        assert_eq!(req.idempotency_key.as_deref(), Some("key-1"));
    }
}
