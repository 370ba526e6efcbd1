// Prometheus metrics for the judge worker, served on GAVEL_METRICS_ADDR

use axum::{http::StatusCode, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info};

struct Metrics {
    registry: Registry,
    runs_judged: IntCounterVec,
    runs_in_progress: IntGauge,
    run_duration: Histogram,
    sandbox_executions: IntCounterVec,
    cache_hits: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Register every worker metric. Calling it again is a no-op.
pub fn init() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let runs_judged = IntCounterVec::new(
        Opts::new("gavel_runs_judged_total", "Runs that reached a terminal status"),
        &["status"],
    )?;
    let runs_in_progress = IntGauge::new("gavel_runs_in_progress", "Runs currently being judged")?;
    let run_duration = Histogram::with_opts(
        HistogramOpts::new("gavel_run_duration_seconds", "Wall time spent judging a run")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
    )?;
    let sandbox_executions = IntCounterVec::new(
        Opts::new("gavel_sandbox_executions_total", "Sandboxed executions by termination"),
        &["termination"],
    )?;
    let cache_hits = IntCounterVec::new(
        Opts::new("gavel_cache_hits_total", "Cache lookups that avoided work"),
        &["cache"],
    )?;

    registry.register(Box::new(runs_judged.clone()))?;
    registry.register(Box::new(runs_in_progress.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(sandbox_executions.clone()))?;
    registry.register(Box::new(cache_hits.clone()))?;

    let _ = METRICS.set(Metrics {
        registry,
        runs_judged,
        runs_in_progress,
        run_duration,
        sandbox_executions,
        cache_hits,
    });
    Ok(())
}

pub fn record_execution(termination: &str) {
    if let Some(m) = METRICS.get() {
        m.sandbox_executions.with_label_values(&[termination]).inc();
    }
}

pub fn record_cache_hit(cache: &str) {
    if let Some(m) = METRICS.get() {
        m.cache_hits.with_label_values(&[cache]).inc();
    }
}

pub fn run_started() {
    if let Some(m) = METRICS.get() {
        m.runs_in_progress.inc();
    }
}

pub fn run_finished(status: &str, elapsed: Duration) {
    if let Some(m) = METRICS.get() {
        m.runs_in_progress.dec();
        m.runs_judged.with_label_values(&[status]).inc();
        m.run_duration.observe(elapsed.as_secs_f64());
    }
}

pub fn render() -> Result<String, prometheus::Error> {
    let Some(m) = METRICS.get() else {
        return Ok(String::new());
    };
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&m.registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Serve `/health` and `/metrics` until the process exits.
pub async fn serve(addr: String) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
