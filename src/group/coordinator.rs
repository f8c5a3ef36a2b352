use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::group::config::{SiteSpec, TaskConfigOverride};
use crate::group::task::{GroupStatus, ScreenshotTask, StatusRecord, TaskGroup};
use crate::storage::queue::TaskQueue;
use crate::storage::registry::GroupRegistry;

/// Creates task groups and reports their aggregate status
pub struct GroupCoordinator {
    registry: Arc<dyn GroupRegistry>,
    queue: Arc<dyn TaskQueue>,

    /// Configured defaults, layered under every request's own default config
    defaults: TaskConfigOverride,
}

impl GroupCoordinator {
    pub fn new(registry: Arc<dyn GroupRegistry>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            registry,
            queue,
            defaults: TaskConfigOverride::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: TaskConfigOverride) -> Self {
        self.defaults = defaults;
        self
    }

    /// Create a group with one task per site and dispatch every task
    ///
    /// All configs are resolved before anything is written, so an invalid site
    /// leaves no trace. The group is registered before the first message is
    /// published: once the id is returned, status queries never see it missing.
    pub async fn create_group(&self, default_config: &TaskConfigOverride, sites: &[SiteSpec]) -> Result<String> {
        if sites.is_empty() {
            return Err(Error::EmptySiteList);
        }

        let group_id = Uuid::new_v4().to_string();
        let base = self.defaults.layered(default_config);

        let tasks = sites
            .iter()
            .enumerate()
            .map(|(position, site)| Ok(ScreenshotTask::new(&group_id, site.resolve(&base, position)?)))
            .collect::<Result<Vec<_>>>()?;

        let group = TaskGroup::new(group_id.clone(), &tasks);
        self.registry.register_group(&group).await?;
        info!("Created group {} with {} task(s)", group_id, tasks.len());

        for task in &tasks {
            if let Err(e) = self.queue.push(&task.message()).await {
                // An unqueued task would keep the group from ever becoming ready
                error!("Failed to dispatch task {}: {}", task.id, e);
                let record = StatusRecord::failed(format!("failed to dispatch task: {}", e));
                if let Err(e) = self.registry.set_task_status(&task.id, record).await {
                    warn!("Could not mark undispatched task {} as failed: {}", task.id, e);
                }
            } else {
                debug!("Dispatched task {} for {}", task.id, task.config.url);
            }
        }

        Ok(group_id)
    }

    /// Current aggregate status; never waits for tasks
    pub async fn get_status(&self, group_id: &str) -> Result<GroupStatus> {
        let group = self
            .registry
            .group(group_id)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group_id.to_string()))?;

        let records = self.registry.statuses(&group).await?;
        Ok(GroupStatus::from_statuses(group_id, records.iter().map(|r| r.status)))
    }

    /// Poll until the group is ready or `deadline` elapses
    ///
    /// Returns the last status seen either way; check `ready` to tell them apart.
    pub async fn wait_until_ready(&self, group_id: &str, poll_interval: Duration, deadline: Duration) -> Result<GroupStatus> {
        let started = Instant::now();

        loop {
            let status = self.get_status(group_id).await?;
            if status.ready || started.elapsed() >= deadline {
                return Ok(status);
            }

            debug!(
                "Group {}: {}/{} settled",
                group_id,
                status.total - status.pending_or_running_count,
                status.total
            );
            sleep(poll_interval).await;
        }
    }
}
