//! HTTP/JSON implementation of [`ManagerClient`].
//!
//! Unary calls are plain JSON requests with a per-request timeout.  The
//! keepalive stream is a single long-lived `POST` whose body is fed from an
//! mpsc channel, one newline-delimited JSON heartbeat per message, so the
//! manager sees heartbeats in send order on one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use super::{
    GetSchedulerRequest, KeepaliveRequest, KeepaliveStream, ManagerClient, Scheduler,
    UpdateSchedulerRequest,
};
use crate::dynconfig::ClusterTopology;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_BUFFER: usize = 16;
const SESSION_HEADER: &str = "x-keepalive-session";

pub struct HttpManagerClient {
    base: String,
    client: reqwest::Client,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl HttpManagerClient {
    pub fn new(addr: &str, request_timeout: Duration) -> Result<Self> {
        // No client-wide timeout: it would also cut the keepalive stream.
        let client = reqwest::Client::builder()
            .user_agent(concat!("meshsched/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build manager HTTP client")?;
        Ok(Self {
            base: normalize_base(addr),
            client,
            request_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn ensure_open(&self) -> Result<()> {
        anyhow::ensure!(
            !self.closed.load(Ordering::Acquire),
            "manager connection is closed"
        );
        Ok(())
    }
}

/// Accept `host:port` as well as full URLs.
pub fn normalize_base(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("{what} rejected by manager: {status} {body}"))
    }
}

#[async_trait]
impl ManagerClient for HttpManagerClient {
    #[instrument(skip(self, req), fields(host_name = %req.host_name))]
    async fn update_scheduler(&self, req: &UpdateSchedulerRequest) -> Result<Scheduler> {
        self.ensure_open()?;
        let resp = self
            .client
            .put(format!("{}/api/v1/schedulers", self.base))
            .timeout(self.request_timeout)
            .json(req)
            .send()
            .await
            .context("update scheduler request failed")?;
        let scheduler = ensure_success(resp, "update scheduler")
            .await?
            .json::<Scheduler>()
            .await
            .context("invalid update scheduler response")?;
        Ok(scheduler)
    }

    async fn keepalive(&self) -> Result<Box<dyn KeepaliveStream>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(KEEPALIVE_BUFFER);
        let session = uuid::Uuid::new_v4().to_string();

        let request = self
            .client
            .post(format!("{}/api/v1/keepalive", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .header(SESSION_HEADER, session.as_str())
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));

        let response = tokio::spawn(async move {
            let resp = request.send().await.context("keepalive request failed")?;
            ensure_success(resp, "keepalive").await?;
            Ok::<(), anyhow::Error>(())
        });

        debug!(%session, "keepalive stream opened");
        Ok(Box::new(HttpKeepaliveStream {
            tx: Some(tx),
            response: Some(response),
            session,
        }))
    }

    #[instrument(skip(self, req), fields(cluster_id = req.scheduler_cluster_id))]
    async fn get_scheduler(&self, req: &GetSchedulerRequest) -> Result<ClusterTopology> {
        self.ensure_open()?;
        let resp = self
            .client
            .get(format!(
                "{}/api/v1/scheduler-clusters/{}/topology",
                self.base, req.scheduler_cluster_id
            ))
            .timeout(self.request_timeout)
            .query(&[("host_name", req.host_name.as_str()), ("ip", req.ip.as_str())])
            .send()
            .await
            .context("get scheduler topology request failed")?;
        let topology = ensure_success(resp, "get scheduler topology")
            .await?
            .json::<ClusterTopology>()
            .await
            .context("invalid scheduler topology response")?;
        Ok(topology)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(base = %self.base, "manager connection closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Keepalive stream
// ---------------------------------------------------------------------------

struct HttpKeepaliveStream {
    tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    response: Option<JoinHandle<Result<()>>>,
    session: String,
}

impl HttpKeepaliveStream {
    /// Error describing why the request task already ended.
    async fn finished_error(&mut self) -> anyhow::Error {
        match self.response.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => anyhow!("manager ended keepalive stream {}", self.session),
                Ok(Err(e)) => e,
                Err(e) => anyhow!("keepalive stream task failed: {e}"),
            },
            None => anyhow!("keepalive stream {} is closed", self.session),
        }
    }
}

#[async_trait]
impl KeepaliveStream for HttpKeepaliveStream {
    async fn send(&mut self, req: &KeepaliveRequest) -> Result<()> {
        if self.response.as_ref().map_or(true, JoinHandle::is_finished) {
            return Err(self.finished_error().await);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(anyhow!("keepalive stream {} is closed", self.session));
        };

        let mut line = serde_json::to_vec(req).context("failed to encode keepalive request")?;
        line.push(b'\n');
        if tx.send(Ok(Bytes::from(line))).await.is_err() {
            return Err(self.finished_error().await);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the request body.
        self.tx.take();
        let Some(handle) = self.response.take() else {
            return Ok(());
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow!("keepalive stream task failed: {e}")),
            Err(_) => {
                abort.abort();
                Err(anyhow!("manager did not acknowledge keepalive close in time"))
            }
        }
    }
}

impl Drop for HttpKeepaliveStream {
    fn drop(&mut self) {
        if let Some(handle) = self.response.take() {
            handle.abort();
        }
    }
}
