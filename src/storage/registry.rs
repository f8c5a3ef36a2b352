use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::{Client, aio::MultiplexedConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::QueueSettings;
use crate::error::Result;
use crate::group::task::{StatusRecord, TaskGroup, TaskStatus};

/// Outcome of a status compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The new status was written
    Applied,

    /// The write would not move the task forward; nothing changed
    Ignored { current: TaskStatus },
}

#[cfg(test)]
impl StatusUpdate {
    pub fn applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied)
    }
}

/// Result backend holding group membership and per-task status
///
/// `set_task_status` is the only way status changes. It is atomic per task and
/// forward-only (PENDING < RUNNING < SUCCEEDED | FAILED), so a duplicate or late
/// write never regresses a task and a terminal status is never overwritten.
/// A task with no stored status reads as PENDING.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroupRegistry: Send + Sync {
    /// Record a new group and mark every member PENDING
    async fn register_group(&self, group: &TaskGroup) -> Result<()>;

    async fn group(&self, group_id: &str) -> Result<Option<TaskGroup>>;

    async fn set_task_status(&self, task_id: &str, record: StatusRecord) -> Result<StatusUpdate>;

    async fn task_status(&self, task_id: &str) -> Result<StatusRecord>;

    /// Status of every member, in membership order
    async fn statuses(&self, group: &TaskGroup) -> Result<Vec<StatusRecord>>;
}

const SET_STATUS_SCRIPT: &str = r#"
local rank = { PENDING = 0, RUNNING = 1, SUCCEEDED = 2, FAILED = 2 }
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    current = 'PENDING'
end
if rank[ARGV[1]] > rank[current] then
    redis.call('HSET', KEYS[1], 'status', ARGV[1], 'reason', ARGV[2], 'updated_at', ARGV[3])
    if tonumber(ARGV[4]) > 0 then
        redis.call('EXPIRE', KEYS[1], ARGV[4])
    end
    return { 1, ARGV[1] }
end
return { 0, current }
"#;

fn group_key(group_id: &str) -> String {
    format!("shooter:group:{}", group_id)
}

fn task_key(task_id: &str) -> String {
    format!("shooter:task:{}", task_id)
}

fn parse_record(fields: HashMap<String, String>) -> anyhow::Result<StatusRecord> {
    let status = match fields.get("status") {
        Some(raw) => raw.parse::<TaskStatus>().map_err(|e| anyhow!(e))?,
        None => return Ok(StatusRecord::new(TaskStatus::Pending)),
    };

    let reason = fields.get("reason").filter(|r| !r.is_empty()).cloned();

    let updated_at = fields
        .get("updated_at")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(StatusRecord { status, reason, updated_at })
}

/// Registry stored in Redis next to the queue
pub struct RedisRegistry {
    /// Seconds before records expire, 0 keeps them forever
    result_ttl: u64,

    set_status: redis::Script,

    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisRegistry {
    pub async fn connect(config: &QueueSettings) -> anyhow::Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self::with_connection(conn, config.result_ttl))
    }

    pub fn with_connection(conn: MultiplexedConnection, result_ttl: u64) -> Self {
        Self {
            result_ttl,
            set_status: redis::Script::new(SET_STATUS_SCRIPT),
            conn_pool: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl GroupRegistry for RedisRegistry {
    async fn register_group(&self, group: &TaskGroup) -> Result<()> {
        let group_json = serde_json::to_string(group)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn_pool.lock().await;

        // Members first, so the group never becomes visible half written
        let mut pipe = redis::pipe();
        pipe.atomic();
        for task_id in group.task_ids() {
            let key = task_key(task_id);
            pipe.cmd("HSET")
                .arg(&key)
                .arg("status")
                .arg(TaskStatus::Pending.as_str())
                .arg("reason")
                .arg("")
                .arg("updated_at")
                .arg(&now)
                .ignore();
            if self.result_ttl > 0 {
                pipe.cmd("EXPIRE").arg(&key).arg(self.result_ttl).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to register task statuses")?;

        let mut set = redis::cmd("SET");
        set.arg(group_key(&group.id)).arg(&group_json).arg("NX");
        if self.result_ttl > 0 {
            set.arg("EX").arg(self.result_ttl);
        }
        let created: Option<String> = set
            .query_async(&mut *conn)
            .await
            .context("Failed to register task group")?;

        if created.is_none() {
            return Err(anyhow!("task group {} is already registered", group.id).into());
        }

        debug!("Registered group {} with {} task(s)", group.id, group.members.len());

        Ok(())
    }

    async fn group(&self, group_id: &str) -> Result<Option<TaskGroup>> {
        let mut conn = self.conn_pool.lock().await;

        let raw: Option<String> = redis::cmd("GET")
            .arg(group_key(group_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read task group")?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_task_status(&self, task_id: &str, record: StatusRecord) -> Result<StatusUpdate> {
        let mut conn = self.conn_pool.lock().await;

        let (applied, current): (i64, String) = self
            .set_status
            .key(task_key(task_id))
            .arg(record.status.as_str())
            .arg(record.reason.as_deref().unwrap_or(""))
            .arg(record.updated_at.to_rfc3339())
            .arg(self.result_ttl)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to update task status")?;

        if applied == 1 {
            debug!("Task {} is now {}", task_id, record.status);
            return Ok(StatusUpdate::Applied);
        }

        let current = current.parse::<TaskStatus>().map_err(|e| anyhow!(e))?;
        debug!("Ignored {} for task {} (already {})", record.status, task_id, current);
        Ok(StatusUpdate::Ignored { current })
    }

    async fn task_status(&self, task_id: &str) -> Result<StatusRecord> {
        let mut conn = self.conn_pool.lock().await;

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(task_key(task_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read task status")?;

        Ok(parse_record(fields)?)
    }

    async fn statuses(&self, group: &TaskGroup) -> Result<Vec<StatusRecord>> {
        if group.members.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_pool.lock().await;

        // One transaction, so the counts come from a single snapshot
        let mut pipe = redis::pipe();
        pipe.atomic();
        for task_id in group.task_ids() {
            pipe.cmd("HGETALL").arg(task_key(task_id));
        }
        let all: Vec<HashMap<String, String>> = pipe
            .query_async(&mut *conn)
            .await
            .context("Failed to read group statuses")?;

        let records = all
            .into_iter()
            .map(parse_record)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(records)
    }
}

/// Process-local registry for standalone runs and tests
#[derive(Default)]
pub struct MemoryRegistry {
    groups: DashMap<String, TaskGroup>,
    tasks: DashMap<String, StatusRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupRegistry for MemoryRegistry {
    async fn register_group(&self, group: &TaskGroup) -> Result<()> {
        if self.groups.contains_key(&group.id) {
            return Err(anyhow!("task group {} is already registered", group.id).into());
        }

        for task_id in group.task_ids() {
            self.tasks
                .insert(task_id.to_string(), StatusRecord::new(TaskStatus::Pending));
        }
        self.groups.insert(group.id.clone(), group.clone());

        Ok(())
    }

    async fn group(&self, group_id: &str) -> Result<Option<TaskGroup>> {
        Ok(self.groups.get(group_id).map(|g| g.value().clone()))
    }

    async fn set_task_status(&self, task_id: &str, record: StatusRecord) -> Result<StatusUpdate> {
        // The entry guard holds the shard lock for the whole compare-and-set
        let mut entry = self
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| StatusRecord::new(TaskStatus::Pending));

        let current = entry.status;
        if current.can_become(record.status) {
            *entry = record;
            Ok(StatusUpdate::Applied)
        } else {
            Ok(StatusUpdate::Ignored { current })
        }
    }

    async fn task_status(&self, task_id: &str) -> Result<StatusRecord> {
        Ok(self
            .tasks
            .get(task_id)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| StatusRecord::new(TaskStatus::Pending)))
    }

    async fn statuses(&self, group: &TaskGroup) -> Result<Vec<StatusRecord>> {
        let mut records = Vec::with_capacity(group.members.len());
        for task_id in group.task_ids() {
            records.push(self.task_status(task_id).await?);
        }
        Ok(records)
    }
}
