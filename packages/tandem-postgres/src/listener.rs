//! LISTEN/NOTIFY-backed notification bus.
//!
//! All topics share one PostgreSQL channel; the topic string travels as
//! the notification payload. Delivery is best-effort on both ends: a
//! failed `pg_notify` is logged and dropped, and a dropped notification
//! costs a worker nothing but wake-up latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tandem::{BusSubscription, Error, NotifyBus, Result};

const DEFAULT_CHANNEL: &str = "tandem_notify";

type SubscriberMap = DashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>;

/// [`NotifyBus`] over a single LISTEN/NOTIFY channel.
pub struct PgNotifyBus {
    pool: PgPool,
    channel: String,
    subscribers: Arc<SubscriberMap>,
    next_id: AtomicU64,
    listener_task: JoinHandle<()>,
}

impl PgNotifyBus {
    /// Connect the listener on the default channel.
    pub async fn connect(pool: PgPool) -> Result<Self> {
        Self::connect_on_channel(pool, DEFAULT_CHANNEL).await
    }

    pub async fn connect_on_channel(pool: PgPool, channel: &str) -> Result<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(Error::storage)?;
        listener.listen(channel).await.map_err(Error::storage)?;

        let subscribers: Arc<SubscriberMap> = Arc::new(DashMap::new());
        let dispatch_to = Arc::clone(&subscribers);
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let topic = notification.payload();
                        if let Some(mut entry) = dispatch_to.get_mut(topic) {
                            entry.retain(|(_, tx)| tx.send(topic.to_string()).is_ok());
                        }
                    }
                    Err(err) => {
                        // The listener reconnects internally; a hard error
                        // here only costs wake-up latency.
                        tracing::warn!(error = %err, "notification listener error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            pool,
            channel: channel.to_string(),
            subscribers,
            next_id: AtomicU64::new(0),
            listener_task,
        })
    }
}

impl Drop for PgNotifyBus {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

impl NotifyBus for PgNotifyBus {
    fn publish(&self, topic: &str) {
        let pool = self.pool.clone();
        let channel = self.channel.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let result = sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&channel)
                .bind(&topic)
                .execute(&pool)
                .await;
            if let Err(err) = result {
                tracing::warn!(topic = %topic, error = %err, "dropped notification");
            }
        });
    }

    fn subscribe(&self, topics: &[String]) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        for topic in topics {
            self.subscribers
                .entry(topic.clone())
                .or_default()
                .push((id, tx.clone()));
        }
        let guard = SubscriptionGuard {
            subscribers: Arc::clone(&self.subscribers),
            topics: topics.to_vec(),
            id,
        };
        BusSubscription::new(rx, Box::new(guard))
    }
}

struct SubscriptionGuard {
    subscribers: Arc<SubscriberMap>,
    topics: Vec<String>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        for topic in &self.topics {
            if let Some(mut entry) = self.subscribers.get_mut(topic) {
                entry.retain(|(sub_id, _)| *sub_id != self.id);
            }
        }
    }
}
