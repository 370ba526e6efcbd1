// Route table for the Gavel API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", post(handlers::submit_run))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/cases", get(handlers::get_case_runs))
        .route("/runs/:run_id/groups", get(handlers::get_group_runs))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
