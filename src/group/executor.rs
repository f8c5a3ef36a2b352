use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::browser::renderer::{RenderOutput, RenderSession, Renderer};
use crate::error::{RenderError, Result};
use crate::group::config::TaskConfig;
use crate::group::task::{ScreenshotTask, StatusRecord, TaskStatus};
use crate::proxy::{connect_in_order, describe};
use crate::storage::artifacts::{ArtifactBundle, ArtifactStore};
use crate::storage::registry::{GroupRegistry, StatusUpdate};
use crate::utils::TaskLog;

/// Upper bound of the random pause drawn when `wait_before_load` is unset
const MAX_RANDOM_WAIT_BEFORE_LOAD: f64 = 5.0;

/// How one delivery of a task ended
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded(ArtifactBundle),

    /// The failure was recorded with this reason
    Failed(String),

    /// Another delivery already brought the task to this terminal status
    AlreadyFinished(TaskStatus),
}

/// Runs one task at a time: proxy fail-over, render, artifact write, status
pub struct TaskExecutor {
    renderer: Arc<dyn Renderer>,
    registry: Arc<dyn GroupRegistry>,
    artifacts: ArtifactStore,

    /// Added on top of the task's own waits when bounding collaborator calls
    render_grace: Duration,
}

impl TaskExecutor {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        registry: Arc<dyn GroupRegistry>,
        artifacts: ArtifactStore,
        render_grace: Duration,
    ) -> Self {
        Self {
            renderer,
            registry,
            artifacts,
            render_grace,
        }
    }

    /// Execute `task` to a terminal status
    ///
    /// Task-level failures (proxy exhaustion, collaborator errors, filesystem
    /// errors) are recorded as FAILED and reported through the outcome. Only a
    /// registry failure is returned as an error, in which case the status may not
    /// have been persisted and the delivery should be retried.
    pub async fn execute(&self, task: &mut ScreenshotTask) -> Result<TaskOutcome> {
        let mut log = TaskLog::new(&task.id);

        match self
            .registry
            .set_task_status(&task.id, StatusRecord::new(TaskStatus::Running))
            .await?
        {
            StatusUpdate::Applied => {}
            StatusUpdate::Ignored { current } if current.is_terminal() => {
                info!("Task {} is already {}, skipping duplicate delivery", task.id, current);
                task.status = current;
                return Ok(TaskOutcome::AlreadyFinished(current));
            }
            StatusUpdate::Ignored { current } => {
                // Redelivered after a worker died mid-task
                warn!("Task {} was already {}, running it again", task.id, current);
            }
        }
        task.status = TaskStatus::Running;

        log.info(format!("Processing {} (group {})", task.config.url, task.group_id));
        log.info(format!("Config: {}", task.config.masked_json()));

        match self.run(task, &mut log).await {
            Ok(bundle) => {
                self.finish(task, StatusRecord::new(TaskStatus::Succeeded)).await?;
                Ok(TaskOutcome::Succeeded(bundle))
            }
            Err(e) if !e.is_task_level() => Err(e),
            Err(e) => {
                let reason = e.to_string();
                log.error(format!("Task failed: {}", reason));

                match self.artifacts.write_failure_log(&task.group_id, &task.id, &log).await {
                    Ok(path) => info!("Failure log for task {} written to {}", task.id, path.display()),
                    Err(write_err) => warn!("Could not persist failure log for task {}: {}", task.id, write_err),
                }

                self.finish(task, StatusRecord::failed(reason.clone())).await?;
                Ok(TaskOutcome::Failed(reason))
            }
        }
    }

    async fn run(&self, task: &ScreenshotTask, log: &mut TaskLog) -> Result<ArtifactBundle> {
        // The folder is named after the config as submitted, before any random draw
        let location = task.config.artifact_location();

        let mut config = task.config.clone();
        if config.wait_before_load.is_none() {
            let secs = rand::thread_rng().gen_range(0.0..MAX_RANDOM_WAIT_BEFORE_LOAD);
            config.wait_before_load = Some(secs);
            log.info(format!("Randomised wait before load: {:.2}s", secs));
        }

        let session_budget = config.session_budget(self.render_grace);
        let renderer: &dyn Renderer = self.renderer.as_ref();
        let effective = &config;

        let established = connect_in_order(
            config.proxy.as_ref(),
            move |proxy| async move {
                match timeout(session_budget, renderer.connect(effective, proxy)).await {
                    Ok(result) => result,
                    Err(_) => Err(RenderError::Timeout(session_budget)),
                }
            },
            |attempt, proxy, err| {
                log.warn(format!("Attempt {} via {} failed: {}", attempt, describe(proxy), err));
            },
        )
        .await?;

        log.info(format!(
            "Session established via {} after {} attempt(s)",
            describe(established.proxy),
            established.attempts
        ));

        let mut session = established.session;
        let rendered = self.render(session.as_mut(), &config).await;
        session.close().await;
        let output = rendered?;

        log.info(format!(
            "Captured screenshot ({} bytes, {} element(s))",
            output.screenshot.len(),
            output.elements.as_ref().map_or(0, |e| e.len())
        ));
        log.info(format!("Writing artifacts to {}/{}", location.host, location.folder));

        self.artifacts.write_bundle(&location, &output, &task.config, log).await
    }

    async fn render(
        &self,
        session: &mut dyn RenderSession,
        config: &TaskConfig,
    ) -> std::result::Result<RenderOutput, RenderError> {
        let budget = config.render_budget(self.render_grace);
        match timeout(budget, session.render(config)).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout(budget)),
        }
    }

    /// Record the terminal status; a concurrent delivery may have beaten us to it
    async fn finish(&self, task: &mut ScreenshotTask, record: StatusRecord) -> Result<()> {
        let status = record.status;
        match self.registry.set_task_status(&task.id, record).await? {
            StatusUpdate::Applied => {
                info!("Task {} {}", task.id, status);
                task.status = status;
            }
            StatusUpdate::Ignored { current } => {
                warn!("Task {} already {}, keeping it", task.id, current);
                task.status = current;
            }
        }
        Ok(())
    }
}
