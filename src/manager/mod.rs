//! Manager control-plane channel.
//!
//! [`ManagerClient`] is the contract this node depends on: register (update
//! the scheduler record), open a keepalive stream, and fetch the topology of
//! its scheduler cluster.  [`http::HttpManagerClient`] implements it over
//! HTTP/JSON; tests substitute in-memory fakes.

pub mod http;
pub mod registration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dynconfig::ClusterTopology;

pub use registration::{KeepaliveStatus, RegistrationClient};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Role of the process talking to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Scheduler,
    Peer,
    SeedPeer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSchedulerRequest {
    pub source_type: SourceType,
    pub host_name: String,
    pub ip: String,
    pub port: u16,
    pub idc: String,
    pub location: String,
    pub scheduler_cluster_id: u64,
}

/// Scheduler record as stored by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    #[serde(default)]
    pub id: u64,
    pub host_name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub scheduler_cluster_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveRequest {
    pub host_name: String,
    pub ip: String,
    pub source_type: SourceType,
    pub cluster_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSchedulerRequest {
    pub host_name: String,
    pub ip: String,
    pub source_type: SourceType,
    pub scheduler_cluster_id: u64,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// Create or update this scheduler's record.
    async fn update_scheduler(&self, req: &UpdateSchedulerRequest) -> Result<Scheduler>;

    /// Open a fresh heartbeat stream.
    async fn keepalive(&self) -> Result<Box<dyn KeepaliveStream>>;

    /// Fetch the topology of the requester's scheduler cluster.
    async fn get_scheduler(&self, req: &GetSchedulerRequest) -> Result<ClusterTopology>;

    /// Release the underlying connection.  Further calls fail.
    async fn close(&self) {}
}

/// Client half of a long-lived heartbeat stream.
///
/// Messages are delivered in send order.  Once `send` fails the stream is
/// dead; callers open a new one rather than resending.
#[async_trait]
pub trait KeepaliveStream: Send {
    async fn send(&mut self, req: &KeepaliveRequest) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
