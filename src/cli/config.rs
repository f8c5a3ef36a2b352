use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

use crate::group::config::TaskConfigOverride;

/// Environment variable overriding `output.root`
pub const OUTPUT_PATH_ENV: &str = "SHOOTER_OUTPUT_PATH";

/// Environment variable overriding `queue.redis_url`
pub const REDIS_URL_ENV: &str = "SHOOTER_REDIS_URL";

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ShooterConfig {
    pub output: OutputSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub renderer: RendererSettings,

    /// Partial task config applied under every request's own default config
    pub defaults: TaskConfigOverride,
}

/// Where artifacts are written
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputSettings {
    pub root: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./output"),
        }
    }
}

/// Queue and result backend selection
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: String, // "redis", "memory"
    pub redis_url: String,

    /// Suffix of the queue keys, lets several deployments share one Redis
    pub name: String,

    /// Lifetime of group and status records in seconds, 0 keeps them forever
    pub result_ttl: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            name: "screenshots".to_string(),
            result_ttl: 0,
        }
    }
}

/// Worker loop settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of in-process workers for standalone runs
    pub concurrency: usize,
    pub poll_interval_ms: u64,

    /// Time budget added on top of a task's own wait parameters
    pub render_grace_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            render_grace_secs: 60,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn render_grace(&self) -> Duration {
        Duration::from_secs(self.render_grace_secs)
    }
}

/// Render/detect collaborator settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RendererSettings {
    pub kind: String, // "webdriver", "remote"
    pub chrome_url: String,
    pub firefox_url: String,

    /// Base URL of the remote render service
    pub service_url: String,
    pub headless: bool,
    pub request_timeout_secs: u64,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            kind: "webdriver".to_string(),
            chrome_url: "http://localhost:9515".to_string(),
            firefox_url: "http://localhost:4444".to_string(),
            service_url: "http://localhost:5000".to_string(),
            headless: true,
            request_timeout_secs: 120,
        }
    }
}

impl ShooterConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "shooter", "shooter") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            config
        };

        Ok(config.with_env_overrides())
    }

    /// Load the configuration given on the command line, or the default one
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::load_from_file(path)?.with_env_overrides()),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Apply `SHOOTER_OUTPUT_PATH` and `SHOOTER_REDIS_URL`
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(OUTPUT_PATH_ENV).ok(),
            std::env::var(REDIS_URL_ENV).ok(),
        )
    }

    fn with_overrides(mut self, output_path: Option<String>, redis_url: Option<String>) -> Self {
        if let Some(root) = output_path.filter(|v| !v.is_empty()) {
            debug!("Output root overridden by environment: {}", root);
            self.output.root = PathBuf::from(root);
        }
        if let Some(url) = redis_url.filter(|v| !v.is_empty()) {
            debug!("Redis URL overridden by environment");
            self.queue.redis_url = url;
        }
        self
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
