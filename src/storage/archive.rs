use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::anyhow;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{Error, Result};
use crate::group::task::{GroupStatus, TaskStatus};
use crate::storage::artifacts::ArtifactStore;
use crate::storage::registry::GroupRegistry;

/// How strict the packager is about unfinished groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Refuse groups that still have pending or running tasks
    Settled,

    /// Package the members that succeeded so far
    Partial,
}

/// What went into an archive
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub status: GroupStatus,

    /// Folder names, in archive order
    pub folders: Vec<String>,

    pub files: usize,
}

/// Packs the artifact folders of a group into one zip archive
pub struct ResultPackager {
    registry: Arc<dyn GroupRegistry>,
    artifacts: ArtifactStore,
}

impl ResultPackager {
    pub fn new(registry: Arc<dyn GroupRegistry>, artifacts: ArtifactStore) -> Self {
        Self { registry, artifacts }
    }

    /// Write the group's archive into `writer` and hand the writer back
    ///
    /// Every member that succeeded and whose artifact folder exists is
    /// included. Entries are `<folder>/<file>`, sorted and with fixed timestamps,
    /// so the same artifacts always give the same bytes.
    pub async fn build_archive<W>(&self, group_id: &str, mode: ArchiveMode, writer: W) -> Result<(W, ArchiveSummary)>
    where
        W: Write + Seek + Send + 'static,
    {
        let group = self
            .registry
            .group(group_id)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group_id.to_string()))?;

        let records = self.registry.statuses(&group).await?;
        let status = GroupStatus::from_statuses(group_id, records.iter().map(|r| r.status));

        if mode == ArchiveMode::Settled && !status.ready {
            return Err(Error::GroupNotReady {
                group_id: group_id.to_string(),
                pending: status.pending_or_running_count,
            });
        }

        // Identical configs share a folder, so members are deduplicated by folder name.
        // Folders outlive groups, so only a member that succeeded here vouches for one.
        let mut locations = BTreeMap::new();
        for (member, record) in group.members.iter().zip(&records) {
            if record.status != TaskStatus::Succeeded {
                debug!("Task {} is {}, skipping", member.task_id, record.status);
            } else if self.artifacts.exists(&member.artifacts).await {
                locations.insert(member.artifacts.folder.clone(), self.artifacts.dir_for(&member.artifacts));
            } else {
                debug!("Task {} has no artifacts yet, skipping", member.task_id);
            }
        }

        if locations.is_empty() {
            return Err(Error::NoArtifacts(group_id.to_string()));
        }

        let folders: Vec<(String, PathBuf)> = locations.into_iter().collect();
        let names: Vec<String> = folders.iter().map(|(name, _)| name.clone()).collect();

        let (writer, files) = tokio::task::spawn_blocking(move || write_zip(writer, &folders))
            .await
            .map_err(|e| anyhow!("archive writer panicked: {}", e))??;

        info!(
            "Packaged {} folder(s), {} file(s) for group {}",
            names.len(),
            files,
            group_id
        );

        Ok((
            writer,
            ArchiveSummary {
                status,
                folders: names,
                files,
            },
        ))
    }
}

fn write_zip<W: Write + Seek>(writer: W, folders: &[(String, PathBuf)]) -> Result<(W, usize)> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());

    let mut zip = ZipWriter::new(writer);
    let mut count = 0;

    for (folder, dir) in folders {
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        files.sort();

        for (name, path) in files {
            zip.start_file(format!("{}/{}", folder, name), options)?;
            let mut file = File::open(&path)?;
            io::copy(&mut file, &mut zip)?;
            count += 1;
        }
    }

    Ok((zip.finish()?, count))
}
