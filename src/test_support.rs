//! In-memory fakes shared by unit tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::coordination::registry::KeyValueStore;
use crate::dynconfig::ClusterTopology;
use crate::manager::{
    GetSchedulerRequest, KeepaliveRequest, KeepaliveStream, ManagerClient, Scheduler,
    UpdateSchedulerRequest,
};

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    topology: Option<ClusterTopology>,
    fetch_error: Option<String>,
    fetches: usize,
    last_fetch_cluster_id: Option<u64>,
    register_error: Option<String>,
    registrations: Vec<UpdateSchedulerRequest>,
    keepalive_error: Option<String>,
    keepalive_opens: Vec<Instant>,
    break_after: Option<usize>,
    closed: bool,
}

/// Scriptable [`ManagerClient`].
#[derive(Default)]
pub struct MockManager {
    state: Mutex<ManagerState>,
    heartbeats: Arc<Mutex<Vec<KeepaliveRequest>>>,
    streams_closed: Arc<AtomicUsize>,
}

impl MockManager {
    fn state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap()
    }

    /// Serve `topology` from now on, clearing any scripted fetch failure.
    pub fn set_topology(&self, topology: ClusterTopology) {
        let mut state = self.state();
        state.topology = Some(topology);
        state.fetch_error = None;
    }

    pub fn fail_fetch(&self, message: &str) {
        self.state().fetch_error = Some(message.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    pub fn last_fetch_cluster_id(&self) -> Option<u64> {
        self.state().last_fetch_cluster_id
    }

    pub fn fail_register(&self, message: &str) {
        self.state().register_error = Some(message.to_string());
    }

    pub fn registrations(&self) -> Vec<UpdateSchedulerRequest> {
        self.state().registrations.clone()
    }

    /// Make every keepalive open fail.
    pub fn fail_keepalive(&self, message: &str) {
        self.state().keepalive_error = Some(message.to_string());
    }

    /// Each stream accepts `sends` heartbeats, then fails.
    pub fn break_streams_after(&self, sends: usize) {
        self.state().break_after = Some(sends);
    }

    /// Times at which a keepalive stream was requested.
    pub fn keepalive_opens(&self) -> Vec<Instant> {
        self.state().keepalive_opens.clone()
    }

    pub fn heartbeats(&self) -> Vec<KeepaliveRequest> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn streams_closed(&self) -> usize {
        self.streams_closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl ManagerClient for MockManager {
    async fn update_scheduler(&self, req: &UpdateSchedulerRequest) -> Result<Scheduler> {
        let mut state = self.state();
        state.registrations.push(req.clone());
        if let Some(message) = &state.register_error {
            return Err(anyhow!("{message}"));
        }
        Ok(Scheduler {
            id: state.registrations.len() as u64,
            host_name: req.host_name.clone(),
            ip: req.ip.clone(),
            port: req.port,
            state: "active".into(),
            scheduler_cluster_id: req.scheduler_cluster_id,
        })
    }

    async fn keepalive(&self) -> Result<Box<dyn KeepaliveStream>> {
        let mut state = self.state();
        state.keepalive_opens.push(Instant::now());
        if let Some(message) = &state.keepalive_error {
            return Err(anyhow!("{message}"));
        }
        Ok(Box::new(MockStream {
            heartbeats: Arc::clone(&self.heartbeats),
            closed: Arc::clone(&self.streams_closed),
            remaining: state.break_after,
        }))
    }

    async fn get_scheduler(&self, req: &GetSchedulerRequest) -> Result<ClusterTopology> {
        let mut state = self.state();
        state.fetches += 1;
        state.last_fetch_cluster_id = Some(req.scheduler_cluster_id);
        if let Some(message) = &state.fetch_error {
            return Err(anyhow!("{message}"));
        }
        state
            .topology
            .clone()
            .ok_or_else(|| anyhow!("no topology published"))
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}

struct MockStream {
    heartbeats: Arc<Mutex<Vec<KeepaliveRequest>>>,
    closed: Arc<AtomicUsize>,
    remaining: Option<usize>,
}

#[async_trait]
impl KeepaliveStream for MockStream {
    async fn send(&mut self, req: &KeepaliveRequest) -> Result<()> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("stream reset by manager"));
            }
            *remaining -= 1;
        }
        self.heartbeats.lock().unwrap().push(req.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

/// [`KeyValueStore`] over a key set.  Supports exact and trailing-`*`
/// patterns, which is all the registry issues.
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<BTreeSet<String>>,
    error: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Mutex::new(keys.into_iter().map(Into::into).collect()),
            error: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        if let Some(message) = self.error.lock().unwrap().as_ref() {
            return Err(anyhow!("{message}"));
        }
        let keys = self.keys.lock().unwrap();
        let matched = match pattern.strip_suffix('*') {
            Some(prefix) => keys.iter().filter(|k| k.starts_with(prefix)).cloned().collect(),
            None => keys.iter().filter(|k| *k == pattern).cloned().collect(),
        };
        Ok(matched)
    }

    async fn ping(&self) -> Result<()> {
        match self.error.lock().unwrap().as_ref() {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}
