use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::group::executor::{TaskExecutor, TaskOutcome};
use crate::group::task::ScreenshotTask;
use crate::storage::queue::TaskQueue;

/// What a single poll of the queue did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The queue was empty
    Idle,

    /// A task was handled and its delivery acknowledged
    Handled,

    /// The registry was unreachable; the task went back on the queue
    Deferred,
}

/// Pulls tasks off the queue and runs them, one at a time
pub struct Worker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: usize, queue: Arc<dyn TaskQueue>, executor: Arc<TaskExecutor>, poll_interval: Duration) -> Self {
        Self {
            id,
            queue,
            executor,
            poll_interval,
        }
    }

    /// Take at most one delivery and run it
    pub async fn run_once(&self) -> Result<Poll> {
        let Some(delivery) = self.queue.pop().await? else {
            return Ok(Poll::Idle);
        };

        let mut task = ScreenshotTask::from_message(delivery.message.clone());
        debug!("Worker {} processing task {}", self.id, task.id);

        match self.executor.execute(&mut task).await {
            Ok(outcome) => {
                match &outcome {
                    TaskOutcome::Succeeded(bundle) => {
                        info!("Worker {} finished task {} into {}", self.id, task.id, bundle.dir.display())
                    }
                    TaskOutcome::Failed(reason) => warn!("Worker {} task {} failed: {}", self.id, task.id, reason),
                    TaskOutcome::AlreadyFinished(status) => {
                        debug!("Worker {} dropped duplicate of task {} ({})", self.id, task.id, status)
                    }
                }
                self.queue.ack(&delivery).await?;
                Ok(Poll::Handled)
            }
            Err(e) => {
                error!("Worker {} could not record task {}: {}", self.id, task.id, e);

                // Back off, then hand the task to whichever worker polls next
                sleep(self.poll_interval).await;
                self.queue.push(&delivery.message).await?;
                self.queue.ack(&delivery).await?;
                warn!("Worker {} requeued task {}", self.id, task.id);
                Ok(Poll::Deferred)
            }
        }
    }

    /// Poll until `shutdown` flips to true; the task in hand is always finished
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker {} started", self.id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(Poll::Handled) => false,
                Ok(Poll::Idle) | Ok(Poll::Deferred) => true,
                Err(e) => {
                    error!("Worker {} queue error: {}", self.id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Worker {} stopped", self.id);
    }
}

/// In-process workers sharing one queue and executor
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        concurrency: usize,
        queue: Arc<dyn TaskQueue>,
        executor: Arc<TaskExecutor>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let concurrency = concurrency.max(1);
        info!("Starting {} worker(s)", concurrency);

        let handles = (0..concurrency)
            .map(|i| {
                let worker = Worker::new(i, queue.clone(), executor.clone(), poll_interval);
                tokio::spawn(worker.run(receiver.clone()))
            })
            .collect();

        Self { shutdown, handles }
    }

    /// Ask every worker to stop after its current task and wait for them
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker panicked: {}", e);
            }
        }
    }
}
