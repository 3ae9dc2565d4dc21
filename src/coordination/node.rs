use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use serde::Serialize;
use tracing::debug;

use crate::config::Config;

/// Immutable identity of this scheduler node.
///
/// Built once at startup and attached to every registration and heartbeat
/// sent to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub host_name: String,
    pub ip: String,
    pub port: u16,
    pub idc: String,
    pub location: String,
    pub cluster_id: u64,
}

impl NodeIdentity {
    /// Derive the identity from configuration, falling back to the detected
    /// host name and outbound IP when they are not pinned explicitly.
    pub fn from_config(config: &Config) -> Self {
        let host_name = config
            .server
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(detect_host_name);
        let ip = config
            .server
            .ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| detect_ip().to_string());

        Self {
            host_name,
            ip,
            port: config.server.port,
            idc: config.host.idc.clone(),
            location: config.host.location.clone(),
            cluster_id: config.manager.scheduler_cluster_id,
        }
    }
}

/// System host name, lossily converted to UTF-8.
pub fn detect_host_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Best-effort discovery of the address used for outbound traffic.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which
/// local address would route to the target.  Falls back to loopback.
pub fn detect_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            debug!("no routable address found; advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
