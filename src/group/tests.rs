use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

use crate::browser::renderer::{RenderOutput, RenderSession, Renderer};
use crate::error::{Error, RenderError};
use crate::group::config::{SiteSpec, TaskConfig, TaskConfigOverride};
use crate::group::coordinator::GroupCoordinator;
use crate::group::executor::{TaskExecutor, TaskOutcome};
use crate::group::task::{StatusRecord, TaskStatus};
use crate::group::worker::{Poll, Worker, WorkerPool};
use crate::proxy::{ProxyChain, ProxyConfig};
use crate::storage::archive::{ArchiveMode, ResultPackager};
use crate::storage::artifacts::ArtifactStore;
use crate::storage::queue::{MemoryQueue, TaskQueue};
use crate::storage::registry::{GroupRegistry, MemoryRegistry};

/// Scripted stand-in for the render collaborator
#[derive(Default)]
struct FakeRenderer {
    /// Proxy hosts whose sessions never come up
    dead_proxies: HashSet<String>,

    /// URLs whose render always fails
    broken_urls: HashSet<String>,

    /// Connect never returns
    hang_on_connect: bool,

    /// Proxy host of every connect attempt, `None` when direct
    connects: Arc<Mutex<Vec<Option<String>>>>,

    /// URL and proxy host of every render
    renders: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

struct FakeSession {
    proxy: Option<String>,
    renders: Arc<Mutex<Vec<(String, Option<String>)>>>,
    broken: bool,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn connect(
        &self,
        config: &TaskConfig,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let host = proxy.map(|p| p.host.clone());
        self.connects.lock().unwrap().push(host.clone());

        if self.hang_on_connect {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        if let Some(h) = &host {
            if self.dead_proxies.contains(h) {
                return Err(RenderError::Connect(format!("proxy {} refused the connection", h)));
            }
        }

        Ok(Box::new(FakeSession {
            proxy: host,
            renders: self.renders.clone(),
            broken: self.broken_urls.contains(&config.url),
        }))
    }
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn render(&mut self, config: &TaskConfig) -> Result<RenderOutput, RenderError> {
        self.renders
            .lock()
            .unwrap()
            .push((config.url.clone(), self.proxy.clone()));

        if self.broken {
            return Err(RenderError::Capture("blank page".to_string()));
        }

        Ok(RenderOutput {
            screenshot: format!("png of {}", config.url).into_bytes(),
            elements: Some(Vec::new()),
            labelled_screenshot: None,
        })
    }

    async fn close(&mut self) {}
}

struct Harness {
    _root: tempfile::TempDir,
    registry: Arc<MemoryRegistry>,
    queue: Arc<MemoryQueue>,
    renderer: Arc<FakeRenderer>,
    coordinator: GroupCoordinator,
    executor: Arc<TaskExecutor>,
    worker: Worker,
    packager: ResultPackager,
}

impl Harness {
    fn new(renderer: FakeRenderer) -> Self {
        Self::with_grace(renderer, Duration::from_secs(5))
    }

    fn with_grace(renderer: FakeRenderer, grace: Duration) -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let registry = Arc::new(MemoryRegistry::new());
        let queue = Arc::new(MemoryQueue::new());
        let renderer = Arc::new(renderer);

        let executor = Arc::new(TaskExecutor::new(renderer.clone(), registry.clone(), store.clone(), grace));
        let worker = Worker::new(0, queue.clone(), executor.clone(), Duration::from_millis(5));

        Self {
            coordinator: GroupCoordinator::new(registry.clone(), queue.clone()),
            packager: ResultPackager::new(registry.clone(), store),
            _root: root,
            registry,
            queue,
            renderer,
            executor,
            worker,
        }
    }

    /// Group default with no random pause, so runs are fast
    fn default_config() -> TaskConfigOverride {
        TaskConfigOverride {
            wait_before_load: Some(0.0),
            wait_after_load: Some(0.0),
            ..Default::default()
        }
    }

    async fn submit(&self, sites: &[SiteSpec]) -> String {
        self.coordinator
            .create_group(&Self::default_config(), sites)
            .await
            .unwrap()
    }

    /// Run the worker until the queue is empty
    async fn drain(&self) {
        loop {
            match self.worker.run_once().await.unwrap() {
                Poll::Idle => break,
                Poll::Handled => {}
                Poll::Deferred => panic!("registry unexpectedly unavailable"),
            }
        }
    }

    fn renders(&self) -> Vec<(String, Option<String>)> {
        self.renderer.renders.lock().unwrap().clone()
    }

    fn connects(&self) -> Vec<Option<String>> {
        self.renderer.connects.lock().unwrap().clone()
    }
}

fn proxy(host: &str) -> ProxyConfig {
    ProxyConfig {
        host: host.to_string(),
        port: 8080,
        username: Some("user".to_string()),
        password: Some("hunter2".to_string()),
        protocol: "http".to_string(),
    }
}

fn site_via(url: &str, proxies: &[&str]) -> SiteSpec {
    SiteSpec::Config(TaskConfigOverride {
        url: Some(url.to_string()),
        proxy: Some(ProxyChain::new(proxies.iter().map(|h| proxy(h)).collect())),
        ..Default::default()
    })
}

#[tokio::test]
async fn scenario_a_all_tasks_succeed() {
    let harness = Harness::new(FakeRenderer::default());
    let group_id = harness
        .submit(&[SiteSpec::from("https://a.example"), SiteSpec::from("https://b.example")])
        .await;

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.succeeded_count, 2);
    assert_eq!(status.failed_count, 0);
    assert!(status.all_successful());

    let (_, summary) = harness
        .packager
        .build_archive(&group_id, ArchiveMode::Settled, Cursor::new(Vec::new()))
        .await
        .unwrap();
    assert_eq!(summary.folders.len(), 2);
}

#[tokio::test]
async fn scenario_b_partial_failure() {
    let harness = Harness::new(FakeRenderer {
        broken_urls: HashSet::from(["https://b.example".to_string()]),
        ..Default::default()
    });
    let group_id = harness
        .submit(&[SiteSpec::from("https://a.example"), SiteSpec::from("https://b.example")])
        .await;

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.succeeded_count, 1);
    assert_eq!(status.failed_count, 1);
    assert!(status.is_partially_failed());

    let (_, summary) = harness
        .packager
        .build_archive(&group_id, ArchiveMode::Settled, Cursor::new(Vec::new()))
        .await
        .unwrap();
    assert_eq!(summary.folders.len(), 1);
    assert!(summary.folders[0].starts_with("a.example__"));

    let partial = harness
        .packager
        .build_archive(&group_id, ArchiveMode::Partial, Cursor::new(Vec::new()))
        .await;
    assert_ok!(partial);
}

#[tokio::test]
async fn scenario_c_empty_site_list() {
    let harness = Harness::new(FakeRenderer::default());
    let err = harness
        .coordinator
        .create_group(&Harness::default_config(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::EmptySiteList));
    assert_eq!(harness.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_d_archive_before_ready() {
    let harness = Harness::new(FakeRenderer::default());
    let group_id = harness.submit(&[SiteSpec::from("https://a.example")]).await;

    let err = harness
        .packager
        .build_archive(&group_id, ArchiveMode::Settled, Cursor::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GroupNotReady { pending: 1, .. }));
}

#[tokio::test]
async fn test_kth_proxy_is_used_for_the_render() {
    let harness = Harness::new(FakeRenderer {
        dead_proxies: HashSet::from(["p1".to_string(), "p2".to_string()]),
        ..Default::default()
    });
    let group_id = harness
        .submit(&[site_via("https://a.example", &["p1", "p2", "p3", "p4"])])
        .await;

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert_eq!(status.succeeded_count, 1);

    // Strict order, no candidate twice, nothing tried after the first success
    assert_eq!(
        harness.connects(),
        vec![Some("p1".to_string()), Some("p2".to_string()), Some("p3".to_string())]
    );
    assert_eq!(
        harness.renders(),
        vec![("https://a.example".to_string(), Some("p3".to_string()))]
    );
}

#[tokio::test]
async fn test_exhausted_chain_never_renders() {
    let harness = Harness::new(FakeRenderer {
        dead_proxies: HashSet::from(["p1".to_string(), "p2".to_string()]),
        ..Default::default()
    });
    let group_id = harness.submit(&[site_via("https://a.example", &["p1", "p2"])]).await;

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.failed_count, 1);
    assert!(harness.renders().is_empty());

    let group = harness.registry.group(&group_id).await.unwrap().unwrap();
    let record = harness.registry.task_status(&group.members[0].task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    let reason = record.reason.unwrap();
    assert!(reason.contains("no driver remaining after 2"));
    assert!(!reason.contains("hunter2"));

    // Nothing to package, but the failure log is kept
    let err = harness
        .packager
        .build_archive(&group_id, ArchiveMode::Settled, Cursor::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoArtifacts(_)));

    let log_path = harness
        ._root
        .path()
        .join("failed")
        .join(&group_id)
        .join(format!("{}.log", group.members[0].task_id));
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("Attempt 1 via http://user:***@p1:8080 failed"));
    assert!(!log.contains("hunter2"));
}

#[tokio::test]
async fn test_hanging_session_times_out() {
    let harness = Harness::with_grace(
        FakeRenderer {
            hang_on_connect: true,
            ..Default::default()
        },
        Duration::from_millis(20),
    );
    let group_id = harness.submit(&[SiteSpec::from("https://slow.example")]).await;

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.failed_count, 1);
    assert!(harness.renders().is_empty());

    // A direct connection is not a proxy chain, so it is not reported as one
    let group = harness.registry.group(&group_id).await.unwrap().unwrap();
    let record = harness.registry.task_status(&group.members[0].task_id).await.unwrap();
    let reason = record.reason.unwrap();
    assert!(reason.starts_with("render failed: timed out"));
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let harness = Harness::new(FakeRenderer::default());
    let group_id = harness.submit(&[SiteSpec::from("https://a.example")]).await;

    // Simulate the queue delivering the same message twice
    let delivery = harness.queue.pop().await.unwrap().unwrap();
    harness.queue.push(&delivery.message).await.unwrap();
    harness.queue.push(&delivery.message).await.unwrap();

    harness.drain().await;
    let first = harness.coordinator.get_status(&group_id).await.unwrap();
    assert_eq!(first.succeeded_count, 1);
    assert_eq!(harness.renders().len(), 1);

    // A late terminal write for the same task changes nothing either
    harness
        .registry
        .set_task_status(&delivery.message.task_id, StatusRecord::failed("late duplicate"))
        .await
        .unwrap();
    let second = harness.coordinator.get_status(&group_id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_executor_reports_already_finished() {
    let harness = Harness::new(FakeRenderer::default());
    harness.submit(&[SiteSpec::from("https://a.example")]).await;

    let delivery = harness.queue.pop().await.unwrap().unwrap();
    let mut task = crate::group::task::ScreenshotTask::from_message(delivery.message.clone());
    let outcome = harness.executor.execute(&mut task).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Succeeded(_)));
    assert_eq!(task.status, TaskStatus::Succeeded);

    let mut again = crate::group::task::ScreenshotTask::from_message(delivery.message);
    let outcome = harness.executor.execute(&mut again).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::AlreadyFinished(TaskStatus::Succeeded)));
    assert_eq!(harness.renders().len(), 1);
}

#[tokio::test]
async fn test_ready_is_monotonic() {
    let harness = Harness::new(FakeRenderer::default());
    let group_id = harness
        .submit(&[SiteSpec::from("https://a.example"), SiteSpec::from("https://b.example")])
        .await;

    let mut seen_ready = false;
    loop {
        let poll = harness.worker.run_once().await.unwrap();
        let status = harness.coordinator.get_status(&group_id).await.unwrap();
        assert!(!(seen_ready && !status.ready), "ready went back to false");
        seen_ready |= status.ready;
        if poll == Poll::Idle {
            break;
        }
    }
    assert!(seen_ready);

    // Regressions are refused, so the group stays ready
    let group = harness.registry.group(&group_id).await.unwrap().unwrap();
    for member in &group.members {
        harness
            .registry
            .set_task_status(&member.task_id, StatusRecord::new(TaskStatus::Running))
            .await
            .unwrap();
    }
    assert!(harness.coordinator.get_status(&group_id).await.unwrap().ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_settles_the_group() {
    let harness = Harness::new(FakeRenderer {
        broken_urls: HashSet::from(["https://c.example".to_string()]),
        ..Default::default()
    });
    let sites: Vec<SiteSpec> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|h| SiteSpec::from(format!("https://{}.example", h).as_str()))
        .collect();
    let group_id = harness.submit(&sites).await;

    let pool = WorkerPool::start(3, harness.queue.clone(), harness.executor.clone(), Duration::from_millis(5));
    let status = harness
        .coordinator
        .wait_until_ready(&group_id, Duration::from_millis(10), Duration::from_secs(10))
        .await
        .unwrap();
    pool.stop().await;

    assert!(status.ready);
    assert_eq!(status.succeeded_count, 4);
    assert_eq!(status.failed_count, 1);
    assert_eq!(harness.queue.in_flight_count().await, 0);
}

#[tokio::test]
async fn test_unchecked_huge_wait_still_settles_the_task() {
    let harness = Harness::new(FakeRenderer::default());
    let group_id = harness.submit(&[SiteSpec::from("https://a.example")]).await;

    // A message that never went through config validation
    let delivery = harness.queue.pop().await.unwrap().unwrap();
    let mut message = delivery.message.clone();
    message.config.wait_after_load = 1e20;
    message.config.scroll_pause_time = f64::INFINITY;
    harness.queue.push(&message).await.unwrap();
    harness.queue.ack(&delivery).await.unwrap();

    harness.drain().await;

    let status = harness.coordinator.get_status(&group_id).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.total - status.pending_or_running_count, 1);
}
