mod config;
mod engine;
mod env;
mod error;
mod evaluator;
mod executor;
mod files;
mod grader;
mod language;
mod metrics;
mod persister;
mod plan;
mod queue;
mod runner;
mod slots;
mod store;
mod tree;
mod verifier;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod testing;

use anyhow::Context;
use config::{LanguageConfigManager, WorkerConfig};
use engine::DockerProvider;
use executor::Judge;
use files::FileStore;
use language::LanguageRegistry;
use queue::{RedisFeed, RunHandler};
use slots::EvaluationSlots;
use std::sync::Arc;
use store::{RedisStore, RunStore};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Gavel worker booting...");

    let config = WorkerConfig::from_env()?;
    metrics::init().context("failed to register metrics")?;

    let languages = LanguageConfigManager::load(&config.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", config.languages_path.display());
        e
    })?;
    info!(languages = ?languages.list_languages(), "Loaded language configurations");

    let provider = DockerProvider::connect().context("failed to connect to Docker")?;
    let registry = Arc::new(LanguageRegistry::new(languages, Arc::new(provider)));

    let (client, conn) = config
        .redis
        .connect()
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis.url))?;
    info!(url = %config.redis.url, "Connected to Redis");

    let store: Arc<dyn RunStore> = Arc::new(RedisStore::new(conn));
    let judge: Arc<dyn RunHandler> = Arc::new(Judge::new(
        store.clone(),
        FileStore::new(config.cache_dir.clone(), store.clone()),
        registry,
        EvaluationSlots::new(config.eval_slots),
        config.root.clone(),
        config.evaluate_all,
    ));

    info!(
        workers = config.workers,
        eval_slots = config.eval_slots,
        evaluate_all = config.evaluate_all,
        root = %config.root.display(),
        "Worker pool starting"
    );
    let (tx, rx) = mpsc::channel(config.workers);
    let _workers = queue::spawn_workers(config.workers, rx, judge);

    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr).await {
            error!(error = %e, "Metrics server stopped");
        }
    });

    let feed = RedisFeed::new(client);
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        dispatched = queue::dispatch(&feed, store.as_ref(), tx) => {
            if let Err(e) = dispatched {
                error!(error = %e, "Run dispatcher stopped");
                return Err(e.into());
            }
        }
        _ = shutdown => {}
    }

    info!("Worker shutdown complete");
    Ok(())
}
