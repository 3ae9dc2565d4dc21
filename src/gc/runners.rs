//! Reclamation runners shipped with the node.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Runner;
use crate::dynconfig::cache::TEMP_PREFIX;

/// Removes temp files left behind by interrupted dynconfig cache writes.
///
/// Only files carrying the cache temp prefix and older than `grace` are
/// touched, so a write in progress is never removed from under its writer.
pub struct OrphanedCacheFiles {
    dir: PathBuf,
    prefix: String,
    grace: Duration,
}

impl OrphanedCacheFiles {
    pub const TASK_ID: &'static str = "orphaned-cache-files";

    pub fn new(dir: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            dir: dir.into(),
            prefix: TEMP_PREFIX.to_string(),
            grace,
        }
    }

    /// Runner for the directory holding `cache_path`.
    pub fn for_cache(cache_path: &Path, grace: Duration) -> Self {
        let dir = match cache_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::new(dir, grace)
    }
}

#[async_trait]
impl Runner for OrphanedCacheFiles {
    async fn run_gc(&self) -> Result<()> {
        let dir = self.dir.clone();
        let prefix = self.prefix.clone();
        let grace = self.grace;

        let removed = tokio::task::spawn_blocking(move || sweep(&dir, &prefix, grace))
            .await
            .context("orphaned cache sweep panicked")??;
        if removed > 0 {
            info!(dir = %self.dir.display(), removed, "removed orphaned cache files");
        }
        Ok(())
    }
}

fn sweep(dir: &Path, prefix: &str, grace: Duration) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "cache dir does not exist yet");
            return Ok(0);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to list cache dir: {}", dir.display()))
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list cache dir: {}", dir.display()))?;
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < grace {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            // Raced with another sweep or the writer's own cleanup.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned cache file"),
        }
    }
    Ok(removed)
}
