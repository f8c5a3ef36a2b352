use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::browser::{create_renderer, Renderer};
use crate::cli::config::ShooterConfig;
use crate::error::Error;
use crate::group::{GroupCoordinator, GroupStatus, SiteSpec, TaskConfigOverride, TaskExecutor, WorkerPool};
use crate::storage::{connect_backends, ArchiveMode, ArchiveSummary, ArtifactStore, Backends, ResultPackager};

/// A group request, as read from `--file`
///
/// Same shape as the HTTP API body: `sites` holds bare URLs or per-site
/// overrides, `default_config` applies to every site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub sites: Vec<SiteSpec>,
    #[serde(default)]
    pub default_config: TaskConfigOverride,
}

impl SubmitRequest {
    pub fn from_urls(urls: Vec<String>) -> Self {
        Self {
            sites: urls.into_iter().map(SiteSpec::Url).collect(),
            default_config: TaskConfigOverride::default(),
        }
    }

    /// Read a request file, JSON when the extension says so, YAML otherwise
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read request file: {}", path.display()))?;

        let request = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::from_str(&contents)
                .context(format!("Failed to parse request file: {}", path.display()))?
        } else {
            serde_yaml::from_str(&contents)
                .context(format!("Failed to parse request file: {}", path.display()))?
        };

        Ok(request)
    }
}

fn coordinator(config: &ShooterConfig, backends: &Backends) -> GroupCoordinator {
    GroupCoordinator::new(backends.registry.clone(), backends.queue.clone())
        .with_defaults(config.defaults.clone())
}

fn executor(config: &ShooterConfig, backends: &Backends, renderer: Arc<dyn Renderer>) -> Arc<TaskExecutor> {
    Arc::new(TaskExecutor::new(
        renderer,
        backends.registry.clone(),
        ArtifactStore::new(&config.output.root),
        config.worker.render_grace(),
    ))
}

fn print_status(status: &GroupStatus) {
    println!("Group ID: {}", status.group_id);
    println!("State: {:?}", status.state());
    println!("Ready: {}", status.ready);
    println!("Succeeded: {}/{}", status.succeeded_count, status.total);
    println!("Failed: {}", status.failed_count);
    println!("Pending or running: {}", status.pending_or_running_count);
}

/// Build the archive in memory and write it out only once it is complete
async fn write_archive(
    packager: &ResultPackager,
    group_id: &str,
    mode: ArchiveMode,
    output: Option<PathBuf>,
) -> Result<(PathBuf, ArchiveSummary)> {
    let (buffer, summary) = packager
        .build_archive(group_id, mode, Cursor::new(Vec::new()))
        .await
        .context(format!("Failed to archive group {}", group_id))?;

    let output_path = output.unwrap_or_else(|| PathBuf::from(format!("{}.zip", group_id)));
    tokio::fs::write(&output_path, buffer.into_inner())
        .await
        .context(format!("Failed to write archive: {}", output_path.display()))?;

    Ok((output_path, summary))
}

/// Create a group and queue its tasks
pub async fn submit(config: &ShooterConfig, request: SubmitRequest, wait: bool, timeout_secs: u64) -> Result<()> {
    let backends = connect_backends(&config.queue).await?;
    let coordinator = coordinator(config, &backends);

    let group_id = coordinator
        .create_group(&request.default_config, &request.sites)
        .await?;

    info!("Task group created with ID: {}", group_id);
    println!("{}", group_id);

    if wait {
        let status = coordinator
            .wait_until_ready(&group_id, config.worker.poll_interval(), Duration::from_secs(timeout_secs))
            .await?;
        if !status.ready {
            warn!("Group {} still running after {}s", group_id, timeout_secs);
        }
        print_status(&status);
    } else {
        info!("Use `shooter status {}` to check the group status", group_id);
    }

    Ok(())
}

/// Print the aggregate status of a group
pub async fn status(config: &ShooterConfig, group_id: &str) -> Result<()> {
    let backends = connect_backends(&config.queue).await?;
    let status = coordinator(config, &backends).get_status(group_id).await?;
    print_status(&status);
    Ok(())
}

/// Package a group's artifacts
pub async fn archive(config: &ShooterConfig, group_id: &str, partial: bool, output: Option<PathBuf>) -> Result<()> {
    let backends = connect_backends(&config.queue).await?;
    let packager = ResultPackager::new(backends.registry.clone(), ArtifactStore::new(&config.output.root));
    let mode = if partial { ArchiveMode::Partial } else { ArchiveMode::Settled };

    let (path, summary) = write_archive(&packager, group_id, mode, output).await?;
    if !summary.status.ready {
        warn!("Group {} is not settled yet, archive may be incomplete", group_id);
    }

    info!(
        "Archived {} folder(s), {} file(s) to {}",
        summary.folders.len(),
        summary.files,
        path.display()
    );

    Ok(())
}

/// Consume tasks until Ctrl-C
pub async fn worker(config: &ShooterConfig, recover: bool) -> Result<()> {
    let backends = connect_backends(&config.queue).await?;

    if recover {
        let moved = backends.queue.requeue_in_flight().await?;
        info!("Recovered {} in-flight task(s)", moved);
    }

    let renderer = create_renderer(&config.renderer)?;
    let pool = WorkerPool::start(
        config.worker.concurrency,
        backends.queue.clone(),
        executor(config, &backends, renderer),
        config.worker.poll_interval(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down workers");
    pool.stop().await;

    Ok(())
}

/// Run a request with in-process queue, registry and workers, then archive it
pub async fn run(config: &ShooterConfig, request: SubmitRequest, output: Option<PathBuf>) -> Result<()> {
    let renderer = create_renderer(&config.renderer)?;
    let (status, archived) = run_standalone(config, renderer, request, output).await?;

    print_status(&status);
    match archived {
        Some((path, summary)) => info!("Archived {} folder(s) to {}", summary.folders.len(), path.display()),
        None => warn!("No task of group {} produced artifacts", status.group_id),
    }

    Ok(())
}

async fn run_standalone(
    config: &ShooterConfig,
    renderer: Arc<dyn Renderer>,
    request: SubmitRequest,
    output: Option<PathBuf>,
) -> Result<(GroupStatus, Option<(PathBuf, ArchiveSummary)>)> {
    let backends = Backends::in_memory();
    let coordinator = coordinator(config, &backends);
    let pool = WorkerPool::start(
        config.worker.concurrency,
        backends.queue.clone(),
        executor(config, &backends, renderer),
        config.worker.poll_interval(),
    );

    let group_id = match coordinator.create_group(&request.default_config, &request.sites).await {
        Ok(id) => id,
        Err(e) => {
            pool.stop().await;
            return Err(e.into());
        }
    };
    info!("Running group {}", group_id);

    let status = coordinator
        .wait_until_ready(&group_id, config.worker.poll_interval(), Duration::MAX)
        .await;
    pool.stop().await;
    let status = status?;

    let packager = ResultPackager::new(backends.registry.clone(), ArtifactStore::new(&config.output.root));
    match write_archive(&packager, &group_id, ArchiveMode::Settled, output).await {
        Ok(archived) => Ok((status, Some(archived))),
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::NoArtifacts(_))) => Ok((status, None)),
        Err(e) => Err(e),
    }
}

/// Print the effective configuration
pub fn show_config(config: &ShooterConfig, path: Option<&Path>) -> Result<()> {
    let path = path.map_or_else(ShooterConfig::default_path, Path::to_path_buf);
    let contents = serde_yaml::to_string(config).context("Failed to serialize configuration")?;

    println!("Configuration file: {}", path.display());
    println!("{}", contents);

    Ok(())
}
