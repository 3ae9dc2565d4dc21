use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::sync::watch;

use crate::coordination::registry::KeyValueStore;
use crate::dynconfig::DynConfig;
use crate::manager::KeepaliveStatus;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub dynconfig: CheckResult,
    /// Absent when no manager is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager: Option<CheckResult>,
    /// Absent when no shared store is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of the application state the health check reads.
#[derive(Clone)]
pub struct HealthState {
    pub dynconfig: Arc<DynConfig>,
    pub keepalive: Option<watch::Receiver<KeepaliveStatus>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_dynconfig(dynconfig: &DynConfig) -> CheckResult {
    match dynconfig.current() {
        None => CheckResult::unhealthy("no cluster config resolved"),
        Some(snapshot) => {
            let age = snapshot.age();
            let stale = if age >= dynconfig.expire_time() {
                ", stale"
            } else {
                ""
            };
            CheckResult::healthy_with(format!(
                "source {:?}, age {}s{stale}",
                snapshot.source,
                age.as_secs()
            ))
        }
    }
}

fn check_keepalive(status: &KeepaliveStatus) -> CheckResult {
    match status {
        KeepaliveStatus::Connected => CheckResult::healthy(),
        KeepaliveStatus::Idle => CheckResult::healthy_with("keepalive not started"),
        KeepaliveStatus::Retrying {
            attempt,
            last_error,
        } => CheckResult::unhealthy(format!("reconnecting after attempt {attempt}: {last_error}")),
        KeepaliveStatus::Degraded {
            attempts,
            last_error,
        } => CheckResult::unhealthy(format!("gave up after {attempts} attempts: {last_error}")),
        KeepaliveStatus::Stopped => CheckResult::unhealthy("keepalive stopped"),
    }
}

async fn check_keydb(store: &dyn KeyValueStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Without cluster config the node cannot schedule anything.
    if !checks.dynconfig.ok {
        return HealthStatus::Unhealthy;
    }
    let optional_ok = [&checks.manager, &checks.keydb]
        .into_iter()
        .flatten()
        .all(|check| check.ok);
    if optional_ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let dynconfig = check_dynconfig(&state.dynconfig);
    let manager = state
        .keepalive
        .as_ref()
        .map(|rx| check_keepalive(&rx.borrow()));
    let keydb = match &state.store {
        Some(store) => Some(check_keydb(store.as_ref()).await),
        None => None,
    };

    let checks = HealthChecks {
        dynconfig,
        manager,
        keydb,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(dynconfig: bool, manager: Option<bool>, keydb: Option<bool>) -> HealthChecks {
        let result = |ok: bool| {
            if ok {
                CheckResult::healthy()
            } else {
                CheckResult::unhealthy("down")
            }
        };
        HealthChecks {
            dynconfig: result(dynconfig),
            manager: manager.map(result),
            keydb: keydb.map(result),
        }
    }

    #[test]
    fn missing_config_is_unhealthy() {
        assert_eq!(
            aggregate_status(&checks(false, Some(true), None)),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn optional_dependencies_degrade() {
        assert_eq!(aggregate_status(&checks(true, None, None)), HealthStatus::Ok);
        assert_eq!(
            aggregate_status(&checks(true, Some(true), Some(true))),
            HealthStatus::Ok
        );
        assert_eq!(
            aggregate_status(&checks(true, Some(false), Some(true))),
            HealthStatus::Degraded
        );
        assert_eq!(
            aggregate_status(&checks(true, None, Some(false))),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn degraded_keepalive_fails_manager_check() {
        let degraded = KeepaliveStatus::Degraded {
            attempts: 100,
            last_error: "connection refused".into(),
        };
        let check = check_keepalive(&degraded);
        assert!(!check.ok);
        assert!(check.detail.unwrap().contains("100 attempts"));
        assert!(check_keepalive(&KeepaliveStatus::Connected).ok);
    }
}
