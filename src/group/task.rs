use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::group::config::TaskConfig;
use crate::storage::artifacts::ArtifactLocation;

/// Lifecycle of a screenshot task; `Succeeded` and `Failed` are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Position in the lifecycle; status only ever moves to a higher rank
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Succeeded | TaskStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_become(&self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Status of one task as stored in the result backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: TaskStatus,

    /// Failure reason for `Failed` tasks
    pub reason: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            reason: Some(reason.into()),
            updated_at: Utc::now(),
        }
    }
}

/// One (site, effective config) unit of rendering work
#[derive(Debug, Clone)]
pub struct ScreenshotTask {
    pub id: String,
    pub group_id: String,
    pub config: TaskConfig,
    pub status: TaskStatus,
}

impl ScreenshotTask {
    pub fn new(group_id: &str, config: TaskConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            config,
            status: TaskStatus::Pending,
        }
    }

    /// Queue payload for this task
    pub fn message(&self) -> TaskMessage {
        TaskMessage {
            task_id: self.id.clone(),
            group_id: self.group_id.clone(),
            config: self.config.clone(),
        }
    }

    /// Rebuild a task on the worker side; status is re-read from the registry
    pub fn from_message(message: TaskMessage) -> Self {
        Self {
            id: message.task_id,
            group_id: message.group_id,
            config: message.config,
            status: TaskStatus::Pending,
        }
    }
}

/// Message published to the work queue, one per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub group_id: String,
    pub config: TaskConfig,
}

/// A task as recorded in its group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub task_id: String,
    pub url: String,
    pub artifacts: ArtifactLocation,
}

impl From<&ScreenshotTask> for GroupMember {
    fn from(task: &ScreenshotTask) -> Self {
        Self {
            task_id: task.id.clone(),
            url: task.config.url.clone(),
            artifacts: task.config.artifact_location(),
        }
    }
}

/// Tasks spawned from one request; membership is fixed at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<GroupMember>,
}

impl TaskGroup {
    pub fn new(id: String, tasks: &[ScreenshotTask]) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            members: tasks.iter().map(GroupMember::from).collect(),
        }
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.task_id.as_str())
    }
}

/// Coarse summary of a group's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    InProgress,
    Succeeded,
    PartiallyFailed,
    Failed,
}

/// Aggregate status of a group, derived on demand from member statuses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub total: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub pending_or_running_count: usize,

    /// True once no member is pending or running
    pub ready: bool,
}

impl GroupStatus {
    pub fn from_statuses<I>(group_id: &str, statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut status = GroupStatus {
            group_id: group_id.to_string(),
            total: 0,
            succeeded_count: 0,
            failed_count: 0,
            pending_or_running_count: 0,
            ready: false,
        };

        for task_status in statuses {
            status.total += 1;
            match task_status {
                TaskStatus::Succeeded => status.succeeded_count += 1,
                TaskStatus::Failed => status.failed_count += 1,
                TaskStatus::Pending | TaskStatus::Running => status.pending_or_running_count += 1,
            }
        }

        status.ready = status.pending_or_running_count == 0;
        status
    }

    #[cfg(test)]
    pub fn all_successful(&self) -> bool {
        self.total > 0 && self.succeeded_count == self.total
    }

    /// Settled, with at least one failed member
    pub fn is_partially_failed(&self) -> bool {
        self.ready && self.failed_count > 0
    }

    pub fn state(&self) -> GroupState {
        if !self.ready {
            GroupState::InProgress
        } else if self.failed_count == 0 {
            GroupState::Succeeded
        } else if self.succeeded_count > 0 {
            GroupState::PartiallyFailed
        } else {
            GroupState::Failed
        }
    }
}
