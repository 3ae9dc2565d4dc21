use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::instrument;

use super::{ClusterTopology, SnapshotSource};
use crate::coordination::node::NodeIdentity;
use crate::manager::{GetSchedulerRequest, ManagerClient, SourceType};

/// Where authoritative topology comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch a complete topology.  Partial results must be reported as errors.
    async fn fetch(&self) -> Result<ClusterTopology>;

    /// Tag recorded on snapshots produced by this source.
    fn kind(&self) -> SnapshotSource;

    /// Durable cache backing this source, if any.
    fn cache_path(&self) -> Option<&Path> {
        None
    }
}

// ---------------------------------------------------------------------------
// Manager-backed
// ---------------------------------------------------------------------------

/// Fetches topology from the manager, scoped to this node's cluster.
pub struct ManagerSource {
    client: Arc<dyn ManagerClient>,
    request: GetSchedulerRequest,
    cache_path: PathBuf,
}

impl ManagerSource {
    pub fn new(
        client: Arc<dyn ManagerClient>,
        identity: &NodeIdentity,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            request: GetSchedulerRequest {
                host_name: identity.host_name.clone(),
                ip: identity.ip.clone(),
                source_type: SourceType::Scheduler,
                scheduler_cluster_id: identity.cluster_id,
            },
            cache_path: cache_path.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for ManagerSource {
    #[instrument(skip(self), fields(cluster_id = self.request.scheduler_cluster_id))]
    async fn fetch(&self) -> Result<ClusterTopology> {
        let topology = self
            .client
            .get_scheduler(&self.request)
            .await
            .context("fetch cluster topology from manager")?;
        topology.validate()?;
        Ok(topology)
    }

    fn kind(&self) -> SnapshotSource {
        SnapshotSource::Remote
    }

    fn cache_path(&self) -> Option<&Path> {
        Some(&self.cache_path)
    }
}

// ---------------------------------------------------------------------------
// Local file
// ---------------------------------------------------------------------------

/// Reads topology from a YAML (or JSON) file.  Never touches the network.
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for LocalFileSource {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch(&self) -> Result<ClusterTopology> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read topology file: {}", self.path.display()))?;
        let topology: ClusterTopology = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse topology file: {}", self.path.display()))?;
        topology.validate()?;
        Ok(topology)
    }

    fn kind(&self) -> SnapshotSource {
        SnapshotSource::LocalFile
    }
}
