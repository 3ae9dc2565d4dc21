//! Durable last-known-good snapshot on local disk.
//!
//! The snapshot is written as JSON to a temp file in the same directory and
//! renamed over the target, so a reader never sees a half-written cache.  A
//! crash between create and rename can leave a temp file behind; those carry
//! [`TEMP_PREFIX`] and are reclaimed by the orphaned-cache GC runner.

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{ConfigSnapshot, SnapshotSource};

/// File-name prefix of in-flight cache writes.
pub const TEMP_PREFIX: &str = ".dynconfig-";

/// Load the cached snapshot, tagging it as [`SnapshotSource::Cached`].
///
/// A missing file is `Ok(None)`.  An unreadable or corrupt file is also
/// treated as absent (with a warning) so that a bad cache never blocks a
/// fresh fetch.
pub fn load(path: &Path) -> Result<Option<ConfigSnapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no dynconfig cache on disk");
            return Ok(None);
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read dynconfig cache: {}", path.display()))
        }
    };

    match serde_json::from_slice::<ConfigSnapshot>(&bytes) {
        Ok(mut snapshot) => {
            snapshot.source = SnapshotSource::Cached;
            Ok(Some(snapshot))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt dynconfig cache");
            Ok(None)
        }
    }
}

/// Atomically replace the cache file with `snapshot`.
pub fn store(path: &Path, snapshot: &ConfigSnapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create dynconfig cache dir: {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(snapshot).context("failed to encode dynconfig cache")?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .context("failed to create dynconfig cache temp file")?;
    tmp.write_all(&json)
        .context("failed to write dynconfig cache temp file")?;
    tmp.as_file()
        .sync_all()
        .context("failed to sync dynconfig cache temp file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to persist dynconfig cache: {}", path.display()))?;

    debug!(path = %path.display(), bytes = json.len(), "dynconfig cache written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynconfig::ClusterTopology;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn stored_snapshot_reloads_as_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dynconfig.json");
        let snapshot = ConfigSnapshot::new(ClusterTopology::sample(), SnapshotSource::Remote);

        store(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap().unwrap();

        assert_eq!(loaded.data, snapshot.data);
        assert_eq!(loaded.resolved_at, snapshot.resolved_at);
        assert_eq!(loaded.source, SnapshotSource::Cached);
    }

    #[test]
    fn store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynconfig.json");
        let snapshot = ConfigSnapshot::new(ClusterTopology::sample(), SnapshotSource::Remote);
        store(&path, &snapshot).unwrap();
        store(&path, &snapshot).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["dynconfig.json".to_string()]);
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynconfig.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load(&path).unwrap().is_none());
    }
}
