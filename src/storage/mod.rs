pub mod archive;
pub mod artifacts;
pub mod queue;
pub mod registry;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::QueueSettings;

// Re-export common types
pub use archive::{ArchiveMode, ArchiveSummary, ResultPackager};
pub use artifacts::ArtifactStore;
pub use queue::{MemoryQueue, RedisQueue, TaskQueue};
pub use registry::{GroupRegistry, MemoryRegistry, RedisRegistry};

/// Queue and result backend sharing one transport
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<dyn GroupRegistry>,
}

impl Backends {
    /// Fresh process-local backends
    pub fn in_memory() -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new()),
            registry: Arc::new(MemoryRegistry::new()),
        }
    }
}

/// Create the backends selected by the settings
pub async fn connect_backends(settings: &QueueSettings) -> Result<Backends> {
    match settings.backend.as_str() {
        "redis" => {
            info!("Using Redis backend at {}", settings.redis_url);
            let queue = RedisQueue::connect(settings).await?;
            let registry = RedisRegistry::connect(settings).await?;
            Ok(Backends {
                queue: Arc::new(queue),
                registry: Arc::new(registry),
            })
        }
        "memory" => {
            info!("Using in-memory backend");
            Ok(Backends::in_memory())
        }
        other => anyhow::bail!("Unsupported queue backend: {}", other),
    }
}
