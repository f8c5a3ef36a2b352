use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::browser::renderer::RenderOutput;
use crate::error::Result;
use crate::group::config::TaskConfig;
use crate::utils::TaskLog;

pub const SCREENSHOT_FILE: &str = "screenshot.png";
pub const ELEMENTS_FILE: &str = "elements.json";
pub const LABELLED_SCREENSHOT_FILE: &str = "screenshot.labelled.png";
pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "log.txt";

/// Deterministic place of a task's artifacts under the output root
///
/// `folder` is `<host>__<browser>__<fullpage|viewport>__<config-hash>` and is
/// also the folder name used inside archives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub host: String,
    pub folder: String,
}

impl ArtifactLocation {
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.host).join(&self.folder)
    }
}

/// Files written for one successful task
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBundle {
    pub dir: PathBuf,
    pub screenshot: PathBuf,
    pub elements: Option<PathBuf>,
    pub labelled_screenshot: Option<PathBuf>,
    pub config: PathBuf,
    pub log: PathBuf,
}

/// Filesystem layout shared by executors and the packager
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn dir_for(&self, location: &ArtifactLocation) -> PathBuf {
        location.dir(&self.root)
    }

    /// Whether any artifacts of this location reached the disk
    pub async fn exists(&self, location: &ArtifactLocation) -> bool {
        fs::metadata(self.dir_for(location))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    /// Write the bundle for a rendered task
    ///
    /// The screenshot goes first so that a bundle interrupted half way still
    /// holds the most useful artifact.
    pub async fn write_bundle(
        &self,
        location: &ArtifactLocation,
        output: &RenderOutput,
        config: &TaskConfig,
        log: &TaskLog,
    ) -> Result<ArtifactBundle> {
        let dir = self.dir_for(location);
        fs::create_dir_all(&dir).await?;

        let screenshot = dir.join(SCREENSHOT_FILE);
        fs::write(&screenshot, &output.screenshot).await?;

        let elements = match &output.elements {
            Some(items) => {
                let path = dir.join(ELEMENTS_FILE);
                fs::write(&path, serde_json::to_vec(items)?).await?;
                Some(path)
            }
            None => None,
        };

        let labelled_screenshot = match &output.labelled_screenshot {
            Some(bytes) => {
                let path = dir.join(LABELLED_SCREENSHOT_FILE);
                fs::write(&path, bytes).await?;
                Some(path)
            }
            None => None,
        };

        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_vec_pretty(&config.masked_json())?).await?;

        let log_path = dir.join(LOG_FILE);
        fs::write(&log_path, log.contents()).await?;

        debug!("Wrote artifacts to {}", dir.display());

        Ok(ArtifactBundle {
            dir,
            screenshot,
            elements,
            labelled_screenshot,
            config: config_path,
            log: log_path,
        })
    }

    /// Path of the log kept for a failed task
    pub fn failure_log_path(&self, group_id: &str, task_id: &str) -> PathBuf {
        self.root
            .join("failed")
            .join(group_id)
            .join(format!("{}.log", task_id))
    }

    /// Persist the log of a failed task outside the artifact tree
    pub async fn write_failure_log(&self, group_id: &str, task_id: &str, log: &TaskLog) -> Result<PathBuf> {
        let path = self.failure_log_path(group_id, task_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, log.contents()).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::renderer::ElementItem;
    use crate::group::config::{SiteSpec, TaskConfigOverride};

    fn config() -> TaskConfig {
        SiteSpec::from("https://example.com")
            .resolve(&TaskConfigOverride::default(), 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_bundle_layout() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let config = config();
        let location = config.artifact_location();
        let mut log = TaskLog::new("t1");
        log.info("Done");

        assert!(!store.exists(&location).await);

        let output = RenderOutput {
            screenshot: vec![0x89, b'P', b'N', b'G'],
            elements: Some(vec![ElementItem {
                id: 1,
                parent_id: None,
                bbox: (0, 0, 10, 10),
                tag_name: "html".into(),
                label: "html".into(),
                position: "static".into(),
                is_visible: true,
                css_selector: "html".into(),
            }]),
            labelled_screenshot: None,
        };

        let bundle = store.write_bundle(&location, &output, &config, &log).await.unwrap();

        assert!(store.exists(&location).await);
        assert_eq!(bundle.dir, root.path().join("example.com").join(&location.folder));
        assert_eq!(std::fs::read(&bundle.screenshot).unwrap(), output.screenshot);
        assert!(bundle.elements.unwrap().exists());
        assert!(bundle.labelled_screenshot.is_none());
        assert!(std::fs::read_to_string(&bundle.log).unwrap().contains("Done"));

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&bundle.config).unwrap()).unwrap();
        assert_eq!(saved["url"], "https://example.com");
    }

    #[tokio::test]
    async fn test_failure_log_stays_out_of_artifact_tree() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let mut log = TaskLog::new("t2");
        log.error("boom");

        let path = store.write_failure_log("g1", "t2", &log).await.unwrap();
        assert_eq!(path, root.path().join("failed").join("g1").join("t2.log"));
        assert!(!store.exists(&config().artifact_location()).await);
    }
}
