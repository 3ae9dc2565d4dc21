use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::interfaces::ClientLike;
use fred::types::CustomCommand;
use tracing::{debug, instrument, trace};

use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Root namespace shared with the manager.
pub const MANAGER_NAMESPACE: &str = "manager";
/// Namespace under which peers announce themselves.
pub const PEERS_NAMESPACE: &str = "peers";

const KEY_DELIMITER: char = ':';

/// `manager:{namespace}`
pub fn make_namespace_key(namespace: &str) -> String {
    format!("{MANAGER_NAMESPACE}{KEY_DELIMITER}{namespace}")
}

/// `manager:{namespace}:{id}`
pub fn make_key(namespace: &str, id: &str) -> String {
    format!("{}{KEY_DELIMITER}{id}", make_namespace_key(namespace))
}

/// Extract the peer id from a `namespace:scope:peer` key.
///
/// Returns `None` unless the key has exactly three non-empty segments.  Keys
/// of any other shape belong to some other producer (or were half written)
/// and are not peer records.
pub fn parse_peer_key(key: &str) -> Option<&str> {
    let mut segments = key.split(KEY_DELIMITER);
    let namespace = segments.next()?;
    let scope = segments.next()?;
    let peer_id = segments.next()?;
    if segments.next().is_some() || namespace.is_empty() || scope.is_empty() || peer_id.is_empty()
    {
        return None;
    }
    Some(peer_id)
}

// ---------------------------------------------------------------------------
// Store abstraction
// ---------------------------------------------------------------------------

/// Minimal read-only view of the shared key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Return every key matching a glob `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl KeyValueStore for fred::clients::Pool {
    /// Uses `KEYS`; the peer namespace is small enough that an incremental
    /// `SCAN` would only add round-trips.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = ClientLike::custom(
            self,
            CustomCommand::new_static("KEYS", None::<u16>, false),
            vec![pattern.to_string()],
        )
        .await
        .with_context(|| format!("KEYS {pattern}"))?;
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = ClientLike::ping(self, None).await.context("KeyDB PING")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Peer registry
// ---------------------------------------------------------------------------

/// Derived, read-only listing of peers announced in the shared store.
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn KeyValueStore>,
    metrics: MetricsRegistry,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, metrics: MetricsRegistry) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Enumerate live peer ids with a single prefix scan.
    ///
    /// An empty store yields an empty list.  A store failure is returned as an
    /// error and means the peer list is currently unknown, not empty.
    #[instrument(skip(self))]
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let pattern = make_key(PEERS_NAMESPACE, "*");
        let keys = self.store.keys(&pattern).await?;

        let peers: Vec<String> = keys
            .iter()
            .filter_map(|key| {
                let parsed = parse_peer_key(key);
                if parsed.is_none() {
                    trace!(%key, "skipping non-peer key");
                }
                parsed.map(String::from)
            })
            .collect();

        self.metrics.metrics.peers_listed.set(peers.len() as i64);
        debug!(scanned = keys.len(), count = peers.len(), "listed peers");
        Ok(peers)
    }
}
