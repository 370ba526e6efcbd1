// Prometheus metrics for the HTTP API, exposed on GET /metrics

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    runs_submitted: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Register every API metric. Calling it again is a no-op.
pub fn init() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();
    let requests = IntCounterVec::new(
        Opts::new("gavel_api_requests_total", "HTTP requests by endpoint and status"),
        &["endpoint", "status"],
    )?;
    let runs_submitted = IntCounterVec::new(
        Opts::new("gavel_api_runs_submitted_total", "Runs queued through the API"),
        &["language"],
    )?;
    registry.register(Box::new(requests.clone()))?;
    registry.register(Box::new(runs_submitted.clone()))?;

    let _ = METRICS.set(Metrics {
        registry,
        requests,
        runs_submitted,
    });
    Ok(())
}

pub fn record_request(endpoint: &str, status: u16) {
    if let Some(m) = METRICS.get() {
        m.requests.with_label_values(&[endpoint, &status.to_string()]).inc();
    }
}

pub fn record_submission(language: &str) {
    if let Some(m) = METRICS.get() {
        m.runs_submitted.with_label_values(&[language]).inc();
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
