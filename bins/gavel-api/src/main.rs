mod handlers;
mod language_config;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use chrono::{DateTime, Utc};
use gavel_common::config::RedisConfig;
use language_config::LanguageRegistry;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub languages: LanguageRegistry,
    pub started_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Gavel API booting...");
    metrics::init().context("failed to register metrics")?;

    let languages_path = std::env::var("GAVEL_LANGUAGES").unwrap_or_else(|_| "config/languages.json".to_string());
    let languages = LanguageRegistry::load_from_file(&languages_path).map_err(|e| {
        error!("{}", e);
        anyhow::anyhow!(e)
    })?;
    info!(languages = ?languages.enabled_languages(), "Loaded language configurations");

    let redis_config = RedisConfig::from_env();
    let (_, redis_conn) = redis_config
        .connect()
        .await
        .with_context(|| format!("failed to connect to Redis at {}", redis_config.url))?;
    info!("Connected to Redis: {}", redis_config.url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        languages,
        started_at: Utc::now(),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("GAVEL_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept runs");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
