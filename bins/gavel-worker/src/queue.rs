/// Submission Queue - From Notifications to Workers
///
/// **Start-up order:**
/// 1. Subscribe to live run notifications
/// 2. Scan the backlog of unfinished runs, ascending by id
/// 3. Dispatch the backlog and remember its highest id
/// 4. Forward live notifications only above that high-water mark
///
/// Subscribing first means no run created during the scan is lost; the
/// high-water mark keeps the overlap from being judged twice.
use crate::error::{JudgeError, JudgeResult};
use crate::store::RunStore;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use gavel_common::redis::{parse_run_notification, NEW_RUN_CHANNEL};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of live run notifications.
#[async_trait]
pub trait RunFeed: Send + Sync {
    /// Raw payloads, in publication order.
    async fn subscribe(&self) -> JudgeResult<BoxStream<'static, String>>;
}

/// Consumes one run id; must tolerate ids that are already finished.
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn handle(&self, run_id: i64);
}

pub struct RedisFeed {
    client: redis::Client,
}

impl RedisFeed {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunFeed for RedisFeed {
    async fn subscribe(&self) -> JudgeResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(NEW_RUN_CHANNEL).await?;
        info!(channel = NEW_RUN_CHANNEL, "Subscribed to run notifications");
        Ok(pubsub.into_on_message().map(|msg| notification_payload(&msg)).boxed())
    }
}

/// Payloads that are not UTF-8 become empty and are dropped as unparseable.
fn notification_payload(msg: &redis::Msg) -> String {
    msg.get_payload::<String>().unwrap_or_default()
}

async fn forward(tx: &mpsc::Sender<i64>, run_id: i64) -> JudgeResult<()> {
    tx.send(run_id)
        .await
        .map_err(|_| JudgeError::Stream("worker pool is gone".to_string()))
}

/// Feed run ids into `tx` until the notification stream ends, which is an error.
pub async fn dispatch(feed: &dyn RunFeed, store: &dyn RunStore, tx: mpsc::Sender<i64>) -> JudgeResult<()> {
    let mut live = feed.subscribe().await?;

    let backlog = store.pending_runs().await?;
    info!(pending = backlog.len(), "Dispatching backlog");
    let mut high_water = 0;
    for run_id in backlog {
        high_water = high_water.max(run_id);
        forward(&tx, run_id).await?;
    }

    while let Some(payload) = live.next().await {
        match parse_run_notification(&payload) {
            Some(run_id) if run_id > high_water => forward(&tx, run_id).await?,
            Some(run_id) => debug!(run_id, high_water, "Notification covered by backlog"),
            None => warn!(payload = %payload, "Dropping unparseable run notification"),
        }
    }
    Err(JudgeError::Stream("run notification stream closed".to_string()))
}

/// Start `count` workers sharing one receiver; each judges a run to
/// completion before taking the next.
pub fn spawn_workers(count: usize, rx: mpsc::Receiver<i64>, handler: Arc<dyn RunHandler>) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|worker| {
            let rx = rx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(run_id) = next else {
                        break;
                    };
                    debug!(worker, run_id, "Picked up run");
                    handler.handle(run_id).await;
                }
                debug!(worker, "Worker stopped");
            })
        })
        .collect()
}
