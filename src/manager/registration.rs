//! Registration and keepalive against the manager.
//!
//! Registration is a single synchronous attempt made before the node serves
//! anything.  Keepalive then runs for the life of the process: it opens one
//! stream, sends a heartbeat every `interval`, and when the stream dies it is
//! reopened under a [`RetryPolicy`].  Exhausting the policy leaves the node
//! serving locally with keepalive reported as degraded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use super::{KeepaliveRequest, ManagerClient, SourceType, UpdateSchedulerRequest};
use crate::config::KeepaliveConfig;
use crate::coordination::node::NodeIdentity;
use crate::metrics::{MetricsRegistry, Outcome, OutcomeLabels};
use crate::retry::{RetryError, RetryPolicy};
use crate::shutdown::ShutdownSignal;

/// Observable state of the keepalive loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeepaliveStatus {
    /// Loop not started.
    Idle,
    /// A stream is open and heartbeats are flowing.
    Connected,
    /// The last stream failed; waiting to reopen.
    Retrying { attempt: u32, last_error: String },
    /// Attempt budget spent.  The manager no longer sees this node as live.
    Degraded { attempts: u32, last_error: String },
    /// Loop exited on shutdown.
    Stopped,
}

pub struct RegistrationClient {
    client: Arc<dyn ManagerClient>,
    identity: NodeIdentity,
    interval: Duration,
    retry: RetryPolicy,
    status: watch::Sender<KeepaliveStatus>,
    metrics: MetricsRegistry,
}

impl RegistrationClient {
    pub fn new(
        client: Arc<dyn ManagerClient>,
        identity: NodeIdentity,
        keepalive: &KeepaliveConfig,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        let interval = keepalive.interval();
        anyhow::ensure!(!interval.is_zero(), "keepalive interval must be non-zero");
        let (status, _) = watch::channel(KeepaliveStatus::Idle);
        Ok(Self {
            client,
            identity,
            interval,
            retry: RetryPolicy::from_keepalive(keepalive),
            status,
            metrics,
        })
    }

    pub fn status(&self) -> watch::Receiver<KeepaliveStatus> {
        self.status.subscribe()
    }

    /// Announce this node to the manager.  Exactly one attempt.
    ///
    /// Returns the host name the manager confirmed, which the rest of the
    /// process uses for log correlation.
    #[instrument(skip(self), fields(host_name = %self.identity.host_name, cluster_id = self.identity.cluster_id))]
    pub async fn register(&self) -> Result<String> {
        let req = UpdateSchedulerRequest {
            source_type: SourceType::Scheduler,
            host_name: self.identity.host_name.clone(),
            ip: self.identity.ip.clone(),
            port: self.identity.port,
            idc: self.identity.idc.clone(),
            location: self.identity.location.clone(),
            scheduler_cluster_id: self.identity.cluster_id,
        };

        let result = self.client.update_scheduler(&req).await;
        self.metrics
            .metrics
            .registrations
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::of(&result),
            })
            .inc();
        let scheduler = result.context("failed to register with manager")?;

        let confirmed = if scheduler.host_name.is_empty() {
            req.host_name
        } else {
            scheduler.host_name
        };
        info!(confirmed = %confirmed, id = scheduler.id, "registered with manager");
        Ok(confirmed)
    }

    /// Run one keepalive stream until it fails or `shutdown` fires.
    ///
    /// A failed send ends the stream; the error is returned and nothing is
    /// resent on it.  Shutdown closes the stream and returns `Ok`.
    pub async fn keepalive(&self, shutdown: &mut ShutdownSignal) -> Result<()> {
        let mut stream = self
            .client
            .keepalive()
            .await
            .context("failed to open keepalive stream")?;
        self.status.send_replace(KeepaliveStatus::Connected);
        debug!("keepalive stream connected");

        let request = KeepaliveRequest {
            host_name: self.identity.host_name.clone(),
            ip: self.identity.ip.clone(),
            source_type: SourceType::Scheduler,
            cluster_id: self.identity.cluster_id,
        };
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.recv() => {
                    if let Err(e) = stream.close().await {
                        debug!(error = %format!("{e:#}"), "keepalive stream close failed");
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    stream
                        .send(&request)
                        .await
                        .context("failed to send keepalive heartbeat")?;
                    self.metrics.metrics.keepalive_heartbeats.inc();
                }
            }
        }
    }

    /// Keep a heartbeat stream alive until shutdown or the retry budget is
    /// spent.  Never panics or exits the process; returns the final status.
    pub async fn run_keepalive(&self, mut shutdown: ShutdownSignal) -> KeepaliveStatus {
        info!(interval = ?self.interval, max_attempts = self.retry.max_attempts, "keepalive loop started");
        let signal = shutdown.clone();

        let result = self
            .retry
            .run(&mut shutdown, |attempt| {
                let mut signal = signal.clone();
                async move {
                    let result = self.keepalive(&mut signal).await;
                    if let Err(e) = &result {
                        self.metrics.metrics.keepalive_stream_failures.inc();
                        self.status.send_replace(KeepaliveStatus::Retrying {
                            attempt,
                            last_error: format!("{e:#}"),
                        });
                    }
                    result
                }
            })
            .await;

        let status = match result {
            Ok(()) | Err(RetryError::Cancelled) => {
                info!("keepalive loop stopped");
                KeepaliveStatus::Stopped
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(
                    attempts,
                    error = %format!("{last:#}"),
                    "keepalive retries exhausted; node is no longer visible to the manager"
                );
                KeepaliveStatus::Degraded {
                    attempts,
                    last_error: format!("{last:#}"),
                }
            }
        };
        self.status.send_replace(status.clone());
        status
    }
}
