use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cli::config::QueueSettings;
use crate::group::task::TaskMessage;

/// A message taken off the queue, kept around until it is acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: TaskMessage,

    /// Payload exactly as stored, needed to remove it from the processing list
    pub raw: String,
}

/// Work queue with at-least-once delivery
///
/// A popped message stays in flight until `ack` is called; a worker that dies
/// in between leaves it in the processing list, from where it can be requeued.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish one task message
    async fn push(&self, message: &TaskMessage) -> Result<()>;

    /// Take the next message, if any, without blocking
    async fn pop(&self) -> Result<Option<Delivery>>;

    /// Drop a delivered message for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Number of messages waiting to be popped
    async fn pending_count(&self) -> Result<usize>;

    /// Move every unacknowledged message back onto the queue
    ///
    /// Only safe while no worker is running, otherwise in-flight work gets
    /// delivered twice (which the registry tolerates, at the cost of a render).
    async fn requeue_in_flight(&self) -> Result<usize>;
}

/// Redis list backed queue
pub struct RedisQueue {
    /// Queue key, producers `LPUSH` here
    queue_key: String,

    /// Messages popped but not yet acknowledged
    processing_key: String,

    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisQueue {
    /// Connect to the queue named in the settings
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self::with_connection(conn, &config.name))
    }

    pub fn with_connection(conn: MultiplexedConnection, name: &str) -> Self {
        Self {
            queue_key: format!("shooter:queue:{}", name),
            processing_key: format!("shooter:processing:{}", name),
            conn_pool: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, message: &TaskMessage) -> Result<()> {
        let task_json = serde_json::to_string(message)
            .context("Failed to serialize task")?;

        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task to Redis queue")?;

        debug!("Pushed task {} to queue", message.task_id);

        Ok(())
    }

    async fn pop(&self) -> Result<Option<Delivery>> {
        let mut conn = self.conn_pool.lock().await;

        let raw: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop task from Redis queue")?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskMessage>(&raw) {
            Ok(message) => {
                debug!("Popped task {} from queue", message.task_id);
                Ok(Some(Delivery { message, raw }))
            }
            Err(e) => {
                // A payload nobody can decode would otherwise loop forever
                warn!("Dropping undecodable queue payload: {}", e);
                redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&raw)
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .context("Failed to drop undecodable task")?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.raw)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to acknowledge task")?;

        debug!("Acknowledged task {}", delivery.message.task_id);

        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;

        let count: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;

        Ok(count)
    }

    async fn requeue_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;
        let mut moved = 0;

        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .query_async(&mut *conn)
                .await
                .context("Failed to requeue in-flight task")?;

            match raw {
                Some(_) => moved += 1,
                None => break,
            }
        }

        if moved > 0 {
            warn!("Requeued {} unacknowledged task(s)", moved);
        }

        Ok(moved)
    }
}

/// Process-local queue for standalone runs and tests
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<Vec<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of popped but unacknowledged messages
    #[cfg(test)]
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, message: &TaskMessage) -> Result<()> {
        let raw = serde_json::to_string(message)
            .context("Failed to serialize task")?;
        self.pending.lock().await.push_back(raw);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Delivery>> {
        let raw = match self.pending.lock().await.pop_front() {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let message: TaskMessage = serde_json::from_str(&raw)
            .context("Failed to deserialize task")?;
        self.in_flight.lock().await.push(raw.clone());

        Ok(Some(Delivery { message, raw }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(pos) = in_flight.iter().position(|raw| *raw == delivery.raw) {
            in_flight.remove(pos);
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.pending.lock().await.len())
    }

    async fn requeue_in_flight(&self) -> Result<usize> {
        let mut in_flight = self.in_flight.lock().await;
        let mut pending = self.pending.lock().await;
        let moved = in_flight.len();
        for raw in in_flight.drain(..).rev() {
            pending.push_front(raw);
        }
        Ok(moved)
    }
}
