use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub dynconfig: DynconfigConfig,
    /// Shared key-value store holding the peer registry.  Optional: without it
    /// the peer listing endpoint reports the registry as unconfigured.
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
    #[serde(default)]
    pub gc: GcConfig,
}

impl Config {
    /// Which dynamic-config source is actually in effect.
    ///
    /// The manager-backed source needs a live manager channel, so it silently
    /// degrades to the local file when no manager address is configured.
    pub fn dynconfig_source(&self) -> DynconfigType {
        match self.dynconfig.source_type {
            DynconfigType::Manager if self.manager.is_enabled() => DynconfigType::Manager,
            _ => DynconfigType::Local,
        }
    }
}

// ---------------------------------------------------------------------------
// Server / host identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Advertised host name.  Defaults to the detected system host name.
    #[serde(default)]
    pub host: Option<String>,
    /// Advertised IP.  Defaults to the first routable local address.
    #[serde(default)]
    pub ip: Option<String>,
    /// Advertised port registered with the manager.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8002`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            ip: None,
            port: default_port(),
            listen: default_listen(),
        }
    }
}

fn default_port() -> u16 {
    8002
}

fn default_listen() -> String {
    "0.0.0.0:8002".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    /// Datacenter tag.
    #[serde(default)]
    pub idc: String,
    /// Free-form location tag (e.g. `region|zone`).
    #[serde(default)]
    pub location: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Manager address (`host:port` or URL).  Empty disables registration,
    /// keepalive and the manager-backed dynconfig source.
    #[serde(default)]
    pub addr: String,
    /// Scheduler cluster this node belongs to.
    #[serde(default = "default_cluster_id")]
    pub scheduler_cluster_id: u64,
    /// Timeout (seconds) for unary manager calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl ManagerConfig {
    pub fn is_enabled(&self) -> bool {
        !self.addr.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            scheduler_cluster_id: default_cluster_id(),
            request_timeout: default_request_timeout(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

fn default_cluster_id() -> u64 {
    1
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    /// Seconds between heartbeats on an open keepalive stream.
    #[serde(default = "default_keepalive_interval")]
    pub interval: u64,
    /// Initial backoff (seconds) before re-opening a failed stream.
    #[serde(default = "default_retry_init_backoff")]
    pub retry_init_backoff: u64,
    /// Upper bound (seconds) on the backoff between attempts.
    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff: u64,
    /// Number of stream attempts before keepalive degrades to log-only.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn retry_init_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_init_backoff)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_max_backoff)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_keepalive_interval(),
            retry_init_backoff: default_retry_init_backoff(),
            retry_max_backoff: default_retry_max_backoff(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_retry_init_backoff() -> u64 {
    5
}

fn default_retry_max_backoff() -> u64 {
    60
}

fn default_retry_max_attempts() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Dynamic config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynconfigType {
    /// Fetch topology from the manager, caching it on disk.
    #[default]
    Manager,
    /// Read topology from a local file only.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynconfigConfig {
    #[serde(rename = "type", default)]
    pub source_type: DynconfigType,
    /// How long (seconds) a resolved snapshot is served without re-fetching.
    #[serde(default = "default_expire_time")]
    pub expire_time: u64,
    /// Background refresh period (seconds).  Defaults to `expire_time`.
    #[serde(default)]
    pub refresh_interval: Option<u64>,
    /// Durable cache of the last snapshot fetched from the manager.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    /// Topology file used by the local source.
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
}

impl DynconfigConfig {
    pub fn expire_time(&self) -> Duration {
        Duration::from_secs(self.expire_time)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.unwrap_or(self.expire_time))
    }
}

impl Default for DynconfigConfig {
    fn default() -> Self {
        Self {
            source_type: DynconfigType::default(),
            expire_time: default_expire_time(),
            refresh_interval: None,
            cache_path: default_cache_path(),
            local_path: default_local_path(),
        }
    }
}

fn default_expire_time() -> u64 {
    30
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/meshsched/dynconfig.json")
}

fn default_local_path() -> PathBuf {
    PathBuf::from("/etc/meshsched/topology.yaml")
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Connections in the pool.  Peer scans are infrequent; two is plenty.
    #[serde(default = "default_keydb_pool_size")]
    pub pool_size: usize,
    /// Per-command and connect timeout in seconds.
    #[serde(default = "default_keydb_command_timeout")]
    pub command_timeout: u64,
}

impl KeyDbConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_keydb_pool_size() -> usize {
    2
}

fn default_keydb_command_timeout() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// Garbage collection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    /// Seconds between sweeps of orphaned dynconfig cache temp files.
    #[serde(default = "default_orphan_cache_interval")]
    pub orphan_cache_interval: u64,
    /// Minimum age (seconds) before a temp file is considered orphaned.
    #[serde(default = "default_orphan_cache_grace")]
    pub orphan_cache_grace: u64,
    /// Optional per-run timeout (seconds) applied to every GC task.
    #[serde(default)]
    pub task_timeout: Option<u64>,
}

impl GcConfig {
    pub fn orphan_cache_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_cache_interval)
    }

    pub fn orphan_cache_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_cache_grace)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout.map(Duration::from_secs)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            orphan_cache_interval: default_orphan_cache_interval(),
            orphan_cache_grace: default_orphan_cache_grace(),
            task_timeout: None,
        }
    }
}

fn default_orphan_cache_interval() -> u64 {
    600
}

fn default_orphan_cache_grace() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let keepalive = &config.manager.keepalive;
    anyhow::ensure!(keepalive.interval > 0, "manager.keepalive.interval must be > 0");
    anyhow::ensure!(
        keepalive.retry_init_backoff <= keepalive.retry_max_backoff,
        "manager.keepalive.retry_init_backoff must not exceed retry_max_backoff"
    );
    anyhow::ensure!(
        keepalive.retry_max_attempts > 0,
        "manager.keepalive.retry_max_attempts must be > 0"
    );
    anyhow::ensure!(
        config.dynconfig.refresh_interval() > Duration::ZERO,
        "dynconfig.refresh_interval must be > 0"
    );
    anyhow::ensure!(
        config.gc.orphan_cache_interval > 0,
        "gc.orphan_cache_interval must be > 0"
    );
    if let Some(keydb) = &config.keydb {
        anyhow::ensure!(!keydb.endpoint.is_empty(), "keydb.endpoint must not be empty");
        anyhow::ensure!(keydb.pool_size > 0, "keydb.pool_size must be > 0");
        anyhow::ensure!(keydb.command_timeout > 0, "keydb.command_timeout must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.manager.scheduler_cluster_id, 1);
        assert_eq!(config.manager.keepalive.retry_max_attempts, 100);
        assert_eq!(config.dynconfig.expire_time(), Duration::from_secs(30));
        assert_eq!(config.dynconfig.refresh_interval(), Duration::from_secs(30));
        assert!(config.keydb.is_none());
        assert!(!config.manager.is_enabled());
    }

    #[test]
    fn manager_source_requires_manager_address() {
        let config = parse_config("dynconfig:\n  type: manager\n").unwrap();
        assert_eq!(config.dynconfig_source(), DynconfigType::Local);

        let config = parse_config(
            "manager:\n  addr: manager.local:65003\ndynconfig:\n  type: manager\n",
        )
        .unwrap();
        assert_eq!(config.dynconfig_source(), DynconfigType::Manager);

        let config =
            parse_config("manager:\n  addr: manager.local:65003\ndynconfig:\n  type: local\n")
                .unwrap();
        assert_eq!(config.dynconfig_source(), DynconfigType::Local);
    }

    #[test]
    fn full_document_parses() {
        let yaml = r#"
server:
  host: sched-1
  ip: 10.0.0.7
  port: 9000
  listen: 127.0.0.1:9000
host:
  idc: idc-a
  location: cn|hz
manager:
  addr: http://manager.local:8080
  scheduler_cluster_id: 7
  keepalive:
    interval: 2
    retry_init_backoff: 1
    retry_max_backoff: 8
    retry_max_attempts: 4
dynconfig:
  type: manager
  expire_time: 10
  refresh_interval: 20
  cache_path: /tmp/meshsched/dynconfig.json
keydb:
  endpoint: redis://keydb.local:6379
gc:
  orphan_cache_interval: 60
  task_timeout: 30
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.host.as_deref(), Some("sched-1"));
        assert_eq!(config.host.idc, "idc-a");
        assert_eq!(config.manager.scheduler_cluster_id, 7);
        assert_eq!(config.manager.keepalive.interval(), Duration::from_secs(2));
        assert_eq!(config.dynconfig.refresh_interval(), Duration::from_secs(20));
        assert_eq!(config.gc.task_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.keydb.as_ref().unwrap().tls);
        assert_eq!(config.keydb.as_ref().unwrap().pool_size, 2);
    }

    #[test]
    fn rejects_inverted_backoff() {
        let yaml = "manager:\n  keepalive:\n    retry_init_backoff: 30\n    retry_max_backoff: 5\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_zero_refresh_interval() {
        assert!(parse_config("dynconfig:\n  expire_time: 0\n").is_err());
        assert!(parse_config("dynconfig:\n  expire_time: 0\n  refresh_interval: 5\n").is_ok());
    }
}
