//! Stale scrape-file sweeper.
//!
//! Periodically scans the scrape directory. A file whose mtime is older than
//! the stale threshold lost its heartbeat: the snapshot's metadata is marked
//! end-of-life first, then the file is removed, so the agent never sees a
//! live file for a closed snapshot. Per-file errors are logged and the sweep
//! continues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use common::Configuration;
use common::metadata::{MetadataError, MetadataStore};

pub struct Sweeper {
    directory: PathBuf,
    interval: Duration,
    stale_threshold: Duration,
    metadata: Arc<dyn MetadataStore>,
}

impl Sweeper {
    pub fn new(
        directory: impl Into<PathBuf>,
        interval: Duration,
        stale_threshold: Duration,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            directory: directory.into(),
            interval,
            stale_threshold,
            metadata,
        }
    }

    /// Build a sweeper from configuration, clamping the scheduling knobs
    /// into the supported window.
    pub fn from_config(config: &Configuration, metadata: Arc<dyn MetadataStore>) -> Self {
        Self::new(
            config.agent.directory.clone(),
            config.manager.effective_interval(),
            config.manager.effective_stale_threshold(),
            metadata,
        )
    }

    /// Run the sweep loop until the task is aborted at shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!(
                "Sweeper running every {:?} with stale threshold {:?}",
                self.interval,
                self.stale_threshold
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One pass over the scrape directory.
    pub async fn sweep_once(&self) {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "Failed to read scrape directory {}: {err}",
                    self.directory.display()
                );
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "yml") {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    log::warn!("Failed to stat {}: {err}", path.display());
                    continue;
                }
            };

            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age <= self.stale_threshold {
                continue;
            }

            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            log::info!("Evicting stale snapshot {id} (age {age:?})");

            // Close the metadata before the file disappears.
            match self.metadata.eol(id).await {
                Ok(()) => {}
                Err(MetadataError::NotFound(_)) => {
                    log::warn!("No metadata document for stale snapshot {id}");
                }
                Err(err) => {
                    log::warn!("Failed to mark snapshot {id} end-of-life: {err}");
                }
            }

            if let Err(err) = tokio::fs::remove_file(&path).await {
                log::warn!("Failed to delete stale file {}: {err}", path.display());
            }
        }
    }
}
