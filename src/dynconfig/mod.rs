//! Dynamic cluster configuration.
//!
//! [`DynConfig`] keeps the latest [`ConfigSnapshot`] of cluster topology and
//! serves it to readers without blocking on the network.  Reads
//! ([`DynConfig::resolve`]) return the installed snapshot immediately; an
//! expired one is refreshed in the background, and a failed fetch leaves the
//! last known snapshot in place.  A background loop ([`DynConfig::serve`])
//! refreshes on its own schedule so topology converges even without readers.
//!
//! Snapshots are immutable and shared as `Arc<ConfigSnapshot>`; a refresh
//! swaps the whole `Arc`, so a reader holds either the old or the new value,
//! never a mix.

pub mod cache;
pub mod source;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::metrics::{MetricsRegistry, Outcome, OutcomeLabels};
use crate::shutdown::ShutdownTrigger;

pub use source::{ConfigSource, LocalFileSource, ManagerSource};

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Authoritative cluster topology as published by the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    #[serde(default)]
    pub scheduler_cluster: SchedulerCluster,
    #[serde(default)]
    pub seed_peers: Vec<SeedPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerCluster {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Scheduling parameters consumed by the scheduling core.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Parameters pushed down to peers that talk to this cluster.
    #[serde(default)]
    pub client_config: BTreeMap<String, serde_json::Value>,
}

/// A seed peer that can back-source content for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub host_name: String,
    pub ip: String,
    pub port: u16,
    pub download_port: u16,
    #[serde(default)]
    pub idc: String,
    #[serde(default)]
    pub location: String,
}

impl ClusterTopology {
    /// Reject topologies that cannot be installed as a whole.
    pub fn validate(&self) -> anyhow::Result<()> {
        for peer in &self.seed_peers {
            anyhow::ensure!(
                !peer.host_name.is_empty() && !peer.ip.is_empty(),
                "seed peer is missing host name or ip: {peer:?}"
            );
            anyhow::ensure!(
                peer.port != 0 && peer.download_port != 0,
                "seed peer {} has a zero port",
                peer.host_name
            );
        }
        Ok(())
    }
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Fetched from the manager by this process.
    Remote,
    /// Loaded from the durable cache written by an earlier fetch.
    Cached,
    /// Read from the local topology file.
    LocalFile,
}

/// A complete, immutable view of cluster topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub data: ClusterTopology,
    pub resolved_at: DateTime<Utc>,
    pub source: SnapshotSource,
}

impl ConfigSnapshot {
    pub fn new(data: ClusterTopology, source: SnapshotSource) -> Self {
        Self {
            data,
            resolved_at: Utc::now(),
            source,
        }
    }

    /// Time since resolution.  Clock skew into the future counts as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.resolved_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DynconfigError {
    /// Nothing has ever been resolved: no cache, no reachable source.
    #[error("no configuration available: {reason}")]
    NoConfigAvailable { reason: String },
    #[error("dynconfig refresh interval must be non-zero")]
    ZeroRefreshInterval,
}

// ---------------------------------------------------------------------------
// DynConfig
// ---------------------------------------------------------------------------

pub struct DynConfig {
    inner: Arc<Inner>,
    refresh_interval: Duration,
    shutdown: ShutdownTrigger,
}

/// Fetch state, shared with background refreshes started by readers.
struct Inner {
    source: Box<dyn ConfigSource>,
    expire: Duration,
    /// Single writer, many readers.  Doubles as the observer channel.
    current: watch::Sender<Option<Arc<ConfigSnapshot>>>,
    /// At most one fetch in flight.
    fetch_lock: Mutex<()>,
    metrics: MetricsRegistry,
}

impl DynConfig {
    /// Build a [`DynConfig`] over `source`.
    ///
    /// Sources with a durable cache are primed from it so a restart can serve
    /// the last known topology before (or without) reaching the source.
    pub fn new(
        source: Box<dyn ConfigSource>,
        expire: Duration,
        refresh_interval: Duration,
        metrics: MetricsRegistry,
    ) -> Result<Self, DynconfigError> {
        if refresh_interval.is_zero() {
            return Err(DynconfigError::ZeroRefreshInterval);
        }
        let initial = match source.cache_path() {
            Some(path) => match cache::load(path) {
                Ok(Some(snapshot)) => {
                    info!(
                        path = %path.display(),
                        resolved_at = %snapshot.resolved_at,
                        "loaded dynconfig snapshot from cache"
                    );
                    Some(Arc::new(snapshot))
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "failed to load dynconfig cache");
                    None
                }
            },
            None => None,
        };

        let (current, _) = watch::channel(initial);
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                expire,
                current,
                fetch_lock: Mutex::new(()),
                metrics,
            }),
            refresh_interval,
            shutdown: ShutdownTrigger::new(),
        })
    }

    /// The snapshot currently installed, without any I/O.
    pub fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.inner.current()
    }

    pub fn expire_time(&self) -> Duration {
        self.inner.expire
    }

    /// Receive every newly installed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ConfigSnapshot>>> {
        self.inner.current.subscribe()
    }

    /// Return a usable snapshot.
    ///
    /// An installed snapshot is returned at once, even when expired; an
    /// expired one also starts a refresh in the background.  Only a node
    /// that has never resolved anything waits on the source, and gets an
    /// error if that fetch fails.
    pub async fn resolve(&self) -> Result<Arc<ConfigSnapshot>, DynconfigError> {
        match self.current() {
            Some(snapshot) => {
                if snapshot.age() >= self.inner.expire {
                    self.refresh_in_background();
                }
                Ok(snapshot)
            }
            None => self.inner.refresh(false).await,
        }
    }

    fn refresh_in_background(&self) {
        // A fetch already in flight will install its own result.
        if self.inner.fetch_lock.try_lock().is_err() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let Ok(_guard) = inner.fetch_lock.try_lock() else {
                return;
            };
            if inner.fresh().is_none() {
                let _ = inner.fetch_locked().await;
            }
        });
    }

    #[cfg(test)]
    async fn refresh(&self, force: bool) -> Result<Arc<ConfigSnapshot>, DynconfigError> {
        self.inner.refresh(force).await
    }

    /// Refresh on a fixed period until [`DynConfig::stop`] is called.
    pub async fn serve(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let start = tokio::time::Instant::now() + self.refresh_interval;
        let mut ticker = tokio::time::interval_at(start, self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.refresh_interval, "dynconfig refresh loop started");
        loop {
            tokio::select! {
                () = shutdown.recv() => break,
                _ = ticker.tick() => {
                    // Failures are already logged and absorbed by refresh().
                    let _ = self.inner.refresh(true).await;
                }
            }
        }
        info!("dynconfig refresh loop stopped");
    }

    /// Ask the refresh loop to exit.  Idempotent; safe if `serve` never ran.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.current.borrow().clone()
    }

    fn fresh(&self) -> Option<Arc<ConfigSnapshot>> {
        self.current().filter(|s| s.age() < self.expire)
    }

    /// Fetch from the source and install the result.
    ///
    /// With `force == false` a caller that waited behind another fetch reuses
    /// that fetch's result instead of issuing its own.
    #[instrument(skip(self))]
    async fn refresh(&self, force: bool) -> Result<Arc<ConfigSnapshot>, DynconfigError> {
        let _guard = self.fetch_lock.lock().await;
        if !force {
            if let Some(snapshot) = self.fresh() {
                return Ok(snapshot);
            }
        }
        self.fetch_locked().await
    }

    /// Caller holds `fetch_lock`.
    async fn fetch_locked(&self) -> Result<Arc<ConfigSnapshot>, DynconfigError> {
        let started = Instant::now();
        let result = self.source.fetch().await;
        self.metrics
            .metrics
            .dynconfig_fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .metrics
            .dynconfig_refreshes
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::of(&result),
            })
            .inc();

        match result {
            Ok(data) => {
                let snapshot = Arc::new(ConfigSnapshot::new(data, self.source.kind()));
                self.current.send_replace(Some(Arc::clone(&snapshot)));
                if let Some(path) = self.source.cache_path() {
                    self.persist(path.to_path_buf(), Arc::clone(&snapshot)).await;
                }
                debug!(source = ?snapshot.source, "dynconfig snapshot installed");
                Ok(snapshot)
            }
            Err(e) => match self.current() {
                Some(snapshot) => {
                    warn!(
                        error = %format!("{e:#}"),
                        source = ?snapshot.source,
                        age_secs = snapshot.age().as_secs(),
                        "dynconfig fetch failed; serving last known snapshot"
                    );
                    Ok(snapshot)
                }
                None => Err(DynconfigError::NoConfigAvailable {
                    reason: format!("{e:#}"),
                }),
            },
        }
    }

    /// Write the cache off the runtime workers.  Failures are logged only;
    /// the in-memory snapshot stays installed.
    async fn persist(&self, path: PathBuf, snapshot: Arc<ConfigSnapshot>) {
        match tokio::task::spawn_blocking(move || cache::store(&path, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "failed to persist dynconfig cache"),
            Err(e) => warn!(error = %e, "dynconfig cache writer did not complete"),
        }
    }
}

#[cfg(test)]
impl ClusterTopology {
    pub fn sample() -> Self {
        Self::sample_named("default")
    }

    pub fn sample_named(name: &str) -> Self {
        let mut config = BTreeMap::new();
        config.insert("filter_parent_limit".to_string(), serde_json::json!(4));
        Self {
            scheduler_cluster: SchedulerCluster {
                id: 1,
                name: name.to_string(),
                config,
                client_config: BTreeMap::new(),
            },
            seed_peers: vec![SeedPeer {
                host_name: format!("{name}-seed"),
                ip: "10.0.0.9".into(),
                port: 8001,
                download_port: 8003,
                idc: String::new(),
                location: String::new(),
            }],
        }
    }
}
