//! Replicated queue bridge — cross-node event replication.
//!
//! A [`ReplicationStrategy`] serializes every event published on a task's
//! main queue and sends it to a shared log so other nodes hosting a tap on
//! the same task observe it too. Inbound items are injected into the local
//! bus without re-persisting or re-broadcasting back onto the log, which
//! would otherwise create an echo loop. A finalized task publishes a
//! poison-pill [`QueueClosedEvent`](crate::types::QueueClosedEvent) item so
//! every node can evict its local main queue.
//!
//! Two implementations are provided:
//! - [`LocalReplicationStrategy`] — single-process fan-out, useful for
//!   tests and as a documented no-op default when no broker is configured.
//! - [`AmqpReplicationStrategy`] and [`RedisReplicationStrategy`] (both
//!   gated behind the `replication` feature) — the real network-backed
//!   strategies, one durable topic exchange / pub-sub channel per
//!   deployment, publishing under a routing key of the task ID.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::A2AResult;
use crate::types::ReplicatedEventQueueItem;

const DEFAULT_CAPACITY: usize = 1024;

/// Cross-node replication capability for the event queue system.
///
/// `send` serializes an outbound event; inbound items arrive through
/// [`subscribe`](ReplicationStrategy::subscribe) and must be marked
/// `closed_event`/replicated on the receive path so the core never
/// re-publishes them back onto the log.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// Send an event to the shared log for a task.
    async fn send(&self, item: ReplicatedEventQueueItem) -> A2AResult<()>;

    /// Send the poison-pill closure for a finalized task.
    async fn publish_closed(&self, task_id: &str) -> A2AResult<()> {
        self.send(ReplicatedEventQueueItem::closed(task_id)).await
    }

    /// Subscribe to items arriving from other nodes.
    ///
    /// Each call returns an independent receiver; all receivers see every
    /// item sent by any node (including this one, for the in-memory
    /// strategy — callers must dedupe against events they just sent
    /// themselves if echo avoidance matters for that strategy).
    fn subscribe(&self) -> broadcast::Receiver<ReplicatedEventQueueItem>;
}

// ---------------------------------------------------------------------------
// LocalReplicationStrategy — in-process reference / no-op default
// ---------------------------------------------------------------------------

/// In-memory reference [`ReplicationStrategy`].
///
/// Fans events out over a local broadcast channel. Useful for exercising
/// multi-node behavior within a single process in tests, and as a
/// documented no-op default for single-instance deployments that never
/// configure a real broker (sends succeed; nothing outside the process
/// ever observes them).
pub struct LocalReplicationStrategy {
    tx: broadcast::Sender<ReplicatedEventQueueItem>,
}

impl LocalReplicationStrategy {
    /// Create a new local strategy with the default channel capacity.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalReplicationStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicationStrategy for LocalReplicationStrategy {
    async fn send(&self, item: ReplicatedEventQueueItem) -> A2AResult<()> {
        debug!(task_id = %item.task_id, closed = item.closed_event, "Replicating event locally");
        // No subscribers is not an error — mirrors EventQueue::publish.
        let _ = self.tx.send(item);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReplicatedEventQueueItem> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// AmqpReplicationStrategy — AMQP-backed network strategy
// ---------------------------------------------------------------------------

#[cfg(feature = "replication")]
mod amqp {
    use super::*;
    use futures::StreamExt;
    use lapin::options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    };
    use lapin::types::FieldTable;
    use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
    use tracing::error;

    const EXCHANGE: &str = "a2a.replication";
    const CONSUMER_TAG: &str = "a2a-core-replication";

    /// Cross-node [`ReplicationStrategy`] backed by a durable AMQP topic
    /// exchange. Routing key is the task ID, so consumers interested in a
    /// single task could bind a narrower pattern; the default consumer
    /// binds `#` to observe every task's replicated events.
    pub struct AmqpReplicationStrategy {
        channel: Channel,
        tx: broadcast::Sender<ReplicatedEventQueueItem>,
    }

    impl AmqpReplicationStrategy {
        /// Connect to the broker at `uri`, declare the durable topic
        /// exchange, and start the background consumer that feeds
        /// [`subscribe`](ReplicationStrategy::subscribe).
        pub async fn connect(uri: &str) -> A2AResult<Self> {
            let connection = Connection::connect(uri, ConnectionProperties::default())
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(
                        format!("AMQP connection failed: {e}"),
                        true,
                    )
                })?;
            let channel = connection.create_channel().await.map_err(|e| {
                crate::error::A2AError::storage_error(format!("AMQP channel failed: {e}"), true)
            })?;

            channel
                .exchange_declare(
                    EXCHANGE,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(
                        format!("AMQP exchange_declare failed: {e}"),
                        true,
                    )
                })?;

            let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
            let strategy = Self { channel, tx };
            strategy.spawn_consumer(connection).await?;
            Ok(strategy)
        }

        async fn spawn_consumer(&self, connection: Connection) -> A2AResult<()> {
            let consume_channel = connection.create_channel().await.map_err(|e| {
                crate::error::A2AError::storage_error(
                    format!("AMQP consumer channel failed: {e}"),
                    true,
                )
            })?;

            let queue = consume_channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(
                        format!("AMQP queue_declare failed: {e}"),
                        true,
                    )
                })?;

            consume_channel
                .queue_bind(
                    queue.name().as_str(),
                    EXCHANGE,
                    "#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(
                        format!("AMQP queue_bind failed: {e}"),
                        true,
                    )
                })?;

            let mut consumer = consume_channel
                .basic_consume(
                    queue.name().as_str(),
                    CONSUMER_TAG,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(
                        format!("AMQP basic_consume failed: {e}"),
                        true,
                    )
                })?;

            let tx = self.tx.clone();
            tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(error = %e, "AMQP delivery error");
                            continue;
                        }
                    };

                    match serde_json::from_slice::<ReplicatedEventQueueItem>(&delivery.data) {
                        Ok(item) => {
                            let _ = tx.send(item);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to deserialize replicated event");
                        }
                    }

                    if let Err(e) = delivery.ack(lapin::options::BasicAckOptions::default()).await
                    {
                        warn!(error = %e, "Failed to ack AMQP delivery");
                    }
                }
            });

            Ok(())
        }
    }

    #[async_trait]
    impl ReplicationStrategy for AmqpReplicationStrategy {
        async fn send(&self, item: ReplicatedEventQueueItem) -> A2AResult<()> {
            let payload = serde_json::to_vec(&item).map_err(|e| {
                crate::error::A2AError::storage_error(
                    format!("failed to serialize replicated event: {e}"),
                    false,
                )
            })?;

            self.channel
                .basic_publish(
                    EXCHANGE,
                    &item.task_id,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default(),
                )
                .await
                .map_err(|e| {
                    crate::error::A2AError::storage_error(format!("AMQP publish failed: {e}"), true)
                })?;

            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<ReplicatedEventQueueItem> {
            self.tx.subscribe()
        }
    }
}

#[cfg(feature = "replication")]
pub use amqp::AmqpReplicationStrategy;

// ---------------------------------------------------------------------------
// RedisReplicationStrategy — Redis pub/sub network strategy
// ---------------------------------------------------------------------------

#[cfg(feature = "replication")]
mod redis_strategy {
    use super::*;
    use futures::StreamExt;
    use redis::AsyncCommands;

    const CHANNEL: &str = "a2a:replication";

    /// Cross-node [`ReplicationStrategy`] backed by Redis pub/sub.
    ///
    /// Simpler alternative to [`super::AmqpReplicationStrategy`] for
    /// deployments that already run Redis and don't need a durable broker —
    /// delivery is at-most-once per subscriber window, which is acceptable
    /// here because C2/C3 reduction is idempotent against missed or
    /// duplicated events.
    pub struct RedisReplicationStrategy {
        client: redis::Client,
        tx: broadcast::Sender<ReplicatedEventQueueItem>,
    }

    impl RedisReplicationStrategy {
        /// Connect to Redis at `url` and start the background subscriber
        /// that feeds [`subscribe`](ReplicationStrategy::subscribe).
        pub async fn connect(url: &str) -> A2AResult<Self> {
            let client = redis::Client::open(url).map_err(|e| {
                crate::error::A2AError::storage_error(format!("Redis client error: {e}"), true)
            })?;

            let (tx, _rx) = broadcast::channel(DEFAULT_CAPACITY);
            let strategy = Self {
                client: client.clone(),
                tx: tx.clone(),
            };
            strategy.spawn_subscriber().await?;
            Ok(strategy)
        }

        async fn spawn_subscriber(&self) -> A2AResult<()> {
            let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
                crate::error::A2AError::storage_error(
                    format!("Redis pubsub connect failed: {e}"),
                    true,
                )
            })?;
            pubsub.subscribe(CHANNEL).await.map_err(|e| {
                crate::error::A2AError::storage_error(format!("Redis subscribe failed: {e}"), true)
            })?;

            let tx = self.tx.clone();
            tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(message) = stream.next().await {
                    let payload: Vec<u8> = match message.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "Redis message payload error");
                            continue;
                        }
                    };

                    match serde_json::from_slice::<ReplicatedEventQueueItem>(&payload) {
                        Ok(item) => {
                            let _ = tx.send(item);
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to deserialize replicated event from Redis");
                        }
                    }
                }
            });

            Ok(())
        }
    }

    #[async_trait]
    impl ReplicationStrategy for RedisReplicationStrategy {
        async fn send(&self, item: ReplicatedEventQueueItem) -> A2AResult<()> {
            let payload = serde_json::to_vec(&item).map_err(|e| {
                crate::error::A2AError::storage_error(
                    format!("failed to serialize replicated event: {e}"),
                    false,
                )
            })?;

            let mut conn = self.client.get_multiplexed_async_connection().await.map_err(|e| {
                crate::error::A2AError::storage_error(
                    format!("Redis connection failed: {e}"),
                    true,
                )
            })?;
            let _: () = conn.publish(CHANNEL, payload).await.map_err(|e| {
                crate::error::A2AError::storage_error(format!("Redis publish failed: {e}"), true)
            })?;

            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<ReplicatedEventQueueItem> {
            self.tx.subscribe()
        }
    }
}

#[cfg(feature = "replication")]
pub use redis_strategy::RedisReplicationStrategy;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicatedEventQueueItem;

    #[tokio::test]
    async fn local_strategy_fans_out_to_all_subscribers() {
        let strategy = Arc::new(LocalReplicationStrategy::new());
        let mut rx1 = strategy.subscribe();
        let mut rx2 = strategy.subscribe();

        strategy
            .send(ReplicatedEventQueueItem::closed("t1"))
            .await
            .unwrap();

        let item1 = rx1.recv().await.unwrap();
        let item2 = rx2.recv().await.unwrap();
        assert_eq!(item1.task_id, "t1");
        assert!(item1.closed_event);
        assert_eq!(item2.task_id, "t1");
    }

    #[tokio::test]
    async fn publish_closed_sends_poison_pill() {
        let strategy = LocalReplicationStrategy::new();
        let mut rx = strategy.subscribe();

        strategy.publish_closed("t2").await.unwrap();

        let item = rx.recv().await.unwrap();
        assert_eq!(item.task_id, "t2");
        assert!(item.closed_event);
    }

    #[tokio::test]
    async fn send_without_subscribers_does_not_error() {
        let strategy = LocalReplicationStrategy::new();
        strategy
            .send(ReplicatedEventQueueItem::closed("t3"))
            .await
            .unwrap();
    }
}
