//! Node lifecycle: build every control-plane component in dependency order,
//! run them, and tear them down in reverse.
//!
//! Startup:
//! 1. Manager channel (only when `manager.addr` is set).
//! 2. Registration: one attempt; failure aborts startup.
//! 3. Dynamic config source and an initial resolve; failure aborts startup.
//! 4. GC framework with the built-in runners.
//! 5. Shared-store peer registry (optional).
//!
//! [`Server::serve`] then starts the config refresh loop, GC, keepalive and
//! finally the HTTP listener.  [`Server::stop`] shuts down the HTTP listener
//! first, then GC / config / keepalive, then closes the manager channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, DynconfigType};
use crate::coordination::node::NodeIdentity;
use crate::coordination::redis;
use crate::coordination::registry::{KeyValueStore, PeerRegistry};
use crate::dynconfig::{ConfigSource, DynConfig, DynconfigError, LocalFileSource, ManagerSource};
use crate::gc::runners::OrphanedCacheFiles;
use crate::gc::{Gc, Task};
use crate::manager::http::HttpManagerClient;
use crate::manager::{KeepaliveStatus, ManagerClient, RegistrationClient};
use crate::metrics::MetricsRegistry;
use crate::shutdown::ShutdownTrigger;

/// Upper bound on waiting for each group of background tasks during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared with HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub dynconfig: Arc<DynConfig>,
    pub gc: Gc,
    pub peers: Option<PeerRegistry>,
    pub keepalive: Option<watch::Receiver<KeepaliveStatus>>,
    pub metrics: MetricsRegistry,
}

#[derive(Default)]
struct Running {
    http: Option<JoinHandle<()>>,
    dynconfig: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<KeepaliveStatus>>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    config: Arc<Config>,
    host_name: String,
    manager: Option<Arc<dyn ManagerClient>>,
    registration: Option<Arc<RegistrationClient>>,
    dynconfig: Arc<DynConfig>,
    gc: Gc,
    peers: Option<PeerRegistry>,
    metrics: MetricsRegistry,
    http_shutdown: ShutdownTrigger,
    keepalive_shutdown: ShutdownTrigger,
    running: Mutex<Running>,
    served: AtomicBool,
    stopped: AtomicBool,
}

impl Server {
    /// Build the node from configuration, connecting to real dependencies.
    pub async fn new(config: Config) -> Result<Self> {
        let manager: Option<Arc<dyn ManagerClient>> = if config.manager.is_enabled() {
            let client =
                HttpManagerClient::new(&config.manager.addr, config.manager.request_timeout())?;
            info!(base = %client.base_url(), "manager channel configured");
            Some(Arc::new(client))
        } else {
            info!("no manager address configured; running standalone");
            None
        };

        let mut server = Self::with_manager(config, manager).await?;

        if let Some(keydb) = server.config.keydb.clone() {
            match redis::connect(&keydb).await {
                Ok(pool) => server.attach_store(Arc::new(pool)),
                Err(e) => {
                    server.stop().await;
                    return Err(e);
                }
            }
        }
        Ok(server)
    }

    /// Build the node over an already-constructed manager channel.
    pub async fn with_manager(
        config: Config,
        manager: Option<Arc<dyn ManagerClient>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = MetricsRegistry::new();
        let identity = NodeIdentity::from_config(&config);
        info!(
            host_name = %identity.host_name,
            ip = %identity.ip,
            cluster_id = identity.cluster_id,
            "node identity established"
        );

        // ---- Registration ----
        let (registration, host_name) = match &manager {
            Some(client) => {
                let registered = async {
                    let registration = RegistrationClient::new(
                        Arc::clone(client),
                        identity.clone(),
                        &config.manager.keepalive,
                        metrics.clone(),
                    )?;
                    let confirmed = registration.register().await?;
                    Ok::<_, anyhow::Error>((registration, confirmed))
                };
                match registered.await {
                    Ok((registration, confirmed)) => (Some(Arc::new(registration)), confirmed),
                    Err(e) => {
                        client.close().await;
                        return Err(e);
                    }
                }
            }
            None => (None, identity.host_name.clone()),
        };

        // ---- Dynamic config ----
        let source: Box<dyn ConfigSource> = match (config.dynconfig_source(), &manager) {
            (DynconfigType::Manager, Some(client)) => Box::new(ManagerSource::new(
                Arc::clone(client),
                &identity,
                &config.dynconfig.cache_path,
            )),
            _ => Box::new(LocalFileSource::new(&config.dynconfig.local_path)),
        };
        info!(source = ?source.kind(), "dynconfig source selected");

        let resolved = async {
            let dynconfig = DynConfig::new(
                source,
                config.dynconfig.expire_time(),
                config.dynconfig.refresh_interval(),
                metrics.clone(),
            )?;
            dynconfig.resolve().await?;
            Ok::<_, DynconfigError>(Arc::new(dynconfig))
        };
        let dynconfig = match resolved.await {
            Ok(dynconfig) => dynconfig,
            Err(e) => {
                if let Some(client) = &manager {
                    client.close().await;
                }
                return Err(e).context("failed to resolve initial cluster config");
            }
        };

        // ---- GC ----
        let gc = Gc::new(metrics.clone());
        let orphans = Task::interval(
            OrphanedCacheFiles::TASK_ID,
            config.gc.orphan_cache_interval(),
            Arc::new(OrphanedCacheFiles::for_cache(
                &config.dynconfig.cache_path,
                config.gc.orphan_cache_grace(),
            )),
        )
        .with_timeout(config.gc.task_timeout());
        if let Err(e) = gc.add(orphans) {
            if let Some(client) = &manager {
                client.close().await;
            }
            return Err(e).context("failed to register gc tasks");
        }

        Ok(Self {
            config,
            host_name,
            manager,
            registration,
            dynconfig,
            gc,
            peers: None,
            metrics,
            http_shutdown: ShutdownTrigger::new(),
            keepalive_shutdown: ShutdownTrigger::new(),
            running: Mutex::new(Running::default()),
            served: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Enable the peer registry over `store`.  Call before [`Server::serve`].
    pub fn attach_store(&mut self, store: Arc<dyn KeyValueStore>) {
        self.peers = Some(PeerRegistry::new(store, self.metrics.clone()));
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn keepalive_status(&self) -> Option<watch::Receiver<KeepaliveStatus>> {
        self.registration.as_ref().map(|r| r.status())
    }

    pub fn state(&self) -> AppState {
        AppState {
            dynconfig: Arc::clone(&self.dynconfig),
            gc: self.gc.clone(),
            peers: self.peers.clone(),
            keepalive: self.keepalive_status(),
            metrics: self.metrics.clone(),
        }
    }

    /// Start every background loop and the HTTP listener.  Returns the bound
    /// listener address.
    pub async fn serve(&self) -> Result<SocketAddr> {
        anyhow::ensure!(
            !self.stopped.load(Ordering::Acquire),
            "server has been stopped"
        );
        anyhow::ensure!(
            !self.served.swap(true, Ordering::AcqRel),
            "server is already serving"
        );
        let mut running = Running::default();

        running.dynconfig = Some(tokio::spawn({
            let dynconfig = Arc::clone(&self.dynconfig);
            async move { dynconfig.serve().await }
        }));

        self.gc.serve();

        if let Some(registration) = &self.registration {
            let registration = Arc::clone(registration);
            let signal = self.keepalive_shutdown.subscribe();
            running.keepalive = Some(tokio::spawn(async move {
                registration.run_keepalive(signal).await
            }));
        }

        let (listener, addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                // Leave the loops registered so stop() can wind them down.
                *self.lock_running() = running;
                return Err(e);
            }
        };

        let app = crate::http::handler::create_router(Arc::new(self.state()));
        let mut signal = self.http_shutdown.subscribe();
        running.http = Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.recv().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "HTTP server failed");
            }
        }));
        info!(%addr, host_name = %self.host_name, "HTTP server listening");

        *self.lock_running() = running;
        Ok(addr)
    }

    /// Tear everything down in reverse start order.  Idempotent; safe to call
    /// without a prior [`Server::serve`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping node");
        let running = std::mem::take(&mut *self.lock_running());

        // ---- HTTP ----
        self.http_shutdown.trigger();
        if let Some(http) = running.http {
            join_within("HTTP server", http).await;
        }

        // ---- GC / dynconfig / keepalive ----
        self.gc.stop();
        self.dynconfig.stop();
        self.keepalive_shutdown.trigger();
        if tokio::time::timeout(STOP_TIMEOUT, self.gc.wait()).await.is_err() {
            warn!("timed out waiting for gc tasks");
        }
        if let Some(dynconfig) = running.dynconfig {
            join_within("dynconfig refresh", dynconfig).await;
        }
        if let Some(keepalive) = running.keepalive {
            join_within("keepalive", keepalive).await;
        }

        // ---- Manager ----
        if let Some(manager) = &self.manager {
            manager.close().await;
        }
        info!("node stopped");
    }

    async fn bind(&self) -> Result<(tokio::net::TcpListener, SocketAddr)> {
        let listen = &self.config.server.listen;
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {listen}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read HTTP listener address")?;
        Ok((listener, addr))
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Running> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn join_within<T>(what: &str, handle: JoinHandle<T>) {
    match tokio::time::timeout(STOP_TIMEOUT, handle).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(task = what, error = %e, "background task ended abnormally"),
        Err(_) => warn!(task = what, "timed out waiting for background task"),
    }
}
