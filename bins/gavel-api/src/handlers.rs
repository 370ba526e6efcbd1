// HTTP route handlers for the Gavel API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose, Engine as _};
use gavel_common::redis;
use gavel_common::types::ProgramSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::language_config::LanguageRegistry;
use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub problem_version_id: i64,
    /// Reuse an existing submission id; a new one is allocated otherwise.
    #[serde(default)]
    pub submission_id: Option<i64>,
    pub language: String,
    /// Relative file name to base64 contents.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub run_id: i64,
    pub submission_id: i64,
}

/// Reject what the worker could never judge before it reaches the queue.
pub fn validate_submission(request: &SubmitRequest, languages: &LanguageRegistry) -> Result<(), String> {
    if !languages.is_enabled(&request.language) {
        return Err(format!(
            "Language '{}' is not enabled; available: {:?}",
            request.language,
            languages.enabled_languages()
        ));
    }
    if request.files.is_empty() {
        return Err("At least one source file is required".to_string());
    }
    for (name, contents) in &request.files {
        if name.is_empty() || name.starts_with('/') || name.split('/').any(|part| part == "..") {
            return Err(format!("Invalid file name: {}", name));
        }
        if general_purpose::STANDARD.decode(contents).is_err() {
            return Err(format!("File {} is not valid base64", name));
        }
    }
    Ok(())
}

fn respond(endpoint: &str, status: StatusCode, body: serde_json::Value) -> Response {
    metrics::record_request(endpoint, status.as_u16());
    (status, Json(body)).into_response()
}

fn failure(endpoint: &str, status: StatusCode, message: impl Into<String>) -> Response {
    respond(endpoint, status, serde_json::json!({ "error": message.into() }))
}

/// POST /runs - Queue a new run of a submission
pub async fn submit_run(State(state): State<Arc<AppState>>, Json(payload): Json<SubmitRequest>) -> Response {
    const ENDPOINT: &str = "submit_run";

    if let Err(message) = validate_submission(&payload, &state.languages) {
        return failure(ENDPOINT, StatusCode::BAD_REQUEST, message);
    }

    let mut conn = state.redis.clone();
    match redis::get_problem(&mut conn, payload.problem_version_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return failure(
                ENDPOINT,
                StatusCode::NOT_FOUND,
                format!("Problem version {} not found", payload.problem_version_id),
            );
        }
        Err(e) => {
            error!(error = %e, "Failed to look up problem version");
            return failure(ENDPOINT, StatusCode::INTERNAL_SERVER_ERROR, format!("Storage error: {}", e));
        }
    }

    let program = ProgramSource {
        language: payload.language.clone(),
        files: payload.files.clone(),
    };
    match redis::queue_run(&mut conn, payload.submission_id, payload.problem_version_id, program).await {
        Ok(run) => {
            info!(
                run_id = run.id,
                submission_id = run.submission_id,
                problem_version_id = run.problem_version_id,
                language = %run.program.language,
                files = run.program.files.len(),
                "Run queued"
            );
            metrics::record_submission(&run.program.language);
            let body = SubmitResponse {
                run_id: run.id,
                submission_id: run.submission_id,
            };
            respond(ENDPOINT, StatusCode::CREATED, serde_json::json!(body))
        }
        Err(e) => {
            error!(error = %e, "Failed to queue run");
            failure(ENDPOINT, StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue run: {}", e))
        }
    }
}

/// GET /runs/{run_id} - Run status and final verdict
pub async fn get_run(State(state): State<Arc<AppState>>, Path(run_id): Path<i64>) -> Response {
    const ENDPOINT: &str = "get_run";

    let mut conn = state.redis.clone();
    match redis::get_run(&mut conn, run_id).await {
        Ok(Some(run)) => respond(ENDPOINT, StatusCode::OK, serde_json::json!(run)),
        Ok(None) => failure(ENDPOINT, StatusCode::NOT_FOUND, format!("Run {} not found", run_id)),
        Err(e) => {
            error!(run_id, error = %e, "Failed to fetch run");
            failure(ENDPOINT, StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query run: {}", e))
        }
    }
}

/// GET /runs/{run_id}/cases - Per test case results
pub async fn get_case_runs(State(state): State<Arc<AppState>>, Path(run_id): Path<i64>) -> Response {
    const ENDPOINT: &str = "get_case_runs";

    let mut conn = state.redis.clone();
    let rows = async {
        if redis::get_run(&mut conn, run_id).await?.is_none() {
            return Ok(None);
        }
        redis::get_case_runs(&mut conn, run_id).await.map(Some)
    }
    .await;
    rows_response(ENDPOINT, run_id, rows)
}

/// GET /runs/{run_id}/groups - Per test group results
pub async fn get_group_runs(State(state): State<Arc<AppState>>, Path(run_id): Path<i64>) -> Response {
    const ENDPOINT: &str = "get_group_runs";

    let mut conn = state.redis.clone();
    let rows = async {
        if redis::get_run(&mut conn, run_id).await?.is_none() {
            return Ok(None);
        }
        redis::get_group_runs(&mut conn, run_id).await.map(Some)
    }
    .await;
    rows_response(ENDPOINT, run_id, rows)
}

fn rows_response<T: Serialize>(endpoint: &str, run_id: i64, rows: ::redis::RedisResult<Option<Vec<T>>>) -> Response {
    match rows {
        Ok(Some(rows)) => respond(endpoint, StatusCode::OK, serde_json::json!(rows)),
        Ok(None) => failure(endpoint, StatusCode::NOT_FOUND, format!("Run {} not found", run_id)),
        Err(e) => {
            error!(run_id, error = %e, "Failed to fetch result rows");
            failure(endpoint, StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query results: {}", e))
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    const ENDPOINT: &str = "status";

    let mut conn = state.redis.clone();
    match redis::pending_run_ids(&mut conn).await {
        Ok(pending) => respond(
            ENDPOINT,
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "languages": state.languages.enabled_languages(),
                "pending_runs": pending.len(),
                "started_at": state.started_at,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Redis unavailable");
            respond(
                ENDPOINT,
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "status": "degraded", "error": e.to_string() }),
            )
        }
    }
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
