use std::time::Duration;
use thiserror::Error;

/// Result alias used by the orchestration core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by group orchestration, task execution and packaging
#[derive(Debug, Error)]
pub enum Error {
    /// A group was requested with no sites; nothing is registered
    #[error("cannot create a task group from an empty site list")]
    EmptySiteList,

    /// The group id is unknown to the registry (never created or expired)
    #[error("task group not found: {0}")]
    UnknownGroup(String),

    /// Every candidate in the task's proxy chain failed to yield a session
    #[error("no driver remaining after {attempts} connection attempt(s): {last_error}")]
    NoDriverRemaining {
        attempts: usize,
        last_error: String,
    },

    /// The render collaborator failed once a session existed
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    /// Archive requested before every member reached a terminal state
    #[error("task group {group_id} is not ready ({pending} task(s) still pending or running)")]
    GroupNotReady {
        group_id: String,
        pending: usize,
    },

    /// The group has no artifact folders on disk
    #[error("task group {0} does not have associated files")]
    NoArtifacts(String),

    /// A site spec or default config could not be resolved
    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive write failed: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Queue or result backend transport failure
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failures raised by the render/detect collaborator
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start browser session: {0}")]
    Connect(String),

    #[error("failed to load {url}: {reason}")]
    Navigation {
        url: String,
        reason: String,
    },

    /// The page redirected somewhere else (blocked proxy, captive portal...)
    #[error("loaded host {actual} does not match requested host {expected}")]
    HostnameMismatch {
        expected: String,
        actual: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("render service error: {0}")]
    Service(String),

    #[error(transparent)]
    WebDriver(#[from] thirtyfour::error::WebDriverError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the error belongs to a single task rather than the whole group
    pub fn is_task_level(&self) -> bool {
        matches!(
            self,
            Error::NoDriverRemaining { .. } | Error::Render(_) | Error::Io(_) | Error::Serialization(_)
        )
    }
}
