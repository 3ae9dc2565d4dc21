//! KeyDB connection backing the peer registry.
//!
//! The registry only reads, and a store outage has to surface as "peer list
//! unknown" instead of a hung request.  Commands therefore fail fast while
//! the pool is reconnecting, and every command carries a timeout.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, TlsConnector};
use fred::types::Builder;
use tracing::info;

use super::registry::KeyValueStore;
use crate::config::KeyDbConfig;

/// Endpoint as a `redis://` / `rediss://` URL.  A bare `host[:port][/db]`
/// gets a scheme, and `tls: true` upgrades `redis://` to `rediss://`.
pub fn keydb_url(config: &KeyDbConfig) -> String {
    let endpoint = config.endpoint.trim();
    let url = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("redis://{endpoint}")
    };
    match url.strip_prefix("redis://") {
        Some(rest) if config.tls => format!("rediss://{rest}"),
        _ => url,
    }
}

/// Client settings for `config`.  A token from `auth_token_env` overrides any
/// password embedded in the endpoint.
pub fn client_config(config: &KeyDbConfig, auth_token: Option<String>) -> Result<FredConfig> {
    let url = keydb_url(config);
    let mut client = FredConfig::from_url(&url)
        .with_context(|| format!("invalid KeyDB endpoint: {}", config.endpoint))?;

    client.fail_fast = true;
    if url.starts_with("rediss://") && client.tls.is_none() {
        client.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token {
        client.password = Some(token);
    }
    Ok(client)
}

/// Connect the pool and confirm the store answers before handing it out.
pub async fn connect(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();
    let client = client_config(config, auth_token)?;
    let database = client.database;
    let timeout = config.command_timeout();

    let mut builder = Builder::from_config(client);
    // Linear reconnect capped at 5s; health reports the store degraded meanwhile.
    builder.set_policy(ReconnectPolicy::new_linear(0, 5_000, 500));
    builder.with_connection_config(|conn| {
        conn.connection_timeout = timeout;
    });
    builder.with_performance_config(|perf| {
        perf.default_command_timeout = timeout;
    });

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;
    KeyValueStore::ping(&pool).await?;

    info!(
        url = %redact(&keydb_url(config)),
        ?database,
        pool_size = config.pool_size,
        timeout = ?timeout,
        "connected to KeyDB"
    );
    Ok(pool)
}

/// Drop any inline credentials before logging.
fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{scheme}://***@{}", &url[at + 1..]),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keydb(endpoint: &str, tls: bool) -> KeyDbConfig {
        KeyDbConfig {
            endpoint: endpoint.into(),
            tls,
            auth_token_env: "KEYDB_AUTH_TOKEN".into(),
            pool_size: 2,
            command_timeout: 2,
        }
    }

    #[test]
    fn bare_endpoint_gets_scheme() {
        assert_eq!(keydb_url(&keydb("keydb.local:6380", false)), "redis://keydb.local:6380");
        assert_eq!(
            keydb_url(&keydb("redis://keydb.local", false)),
            "redis://keydb.local"
        );
    }

    #[test]
    fn tls_flag_upgrades_scheme() {
        assert_eq!(keydb_url(&keydb("keydb.local:6380", true)), "rediss://keydb.local:6380");
        assert_eq!(
            keydb_url(&keydb("rediss://keydb.local:6380", false)),
            "rediss://keydb.local:6380"
        );
    }

    #[test]
    fn database_index_is_kept() {
        let client = client_config(&keydb("keydb.local:6381/2", false), None).unwrap();
        assert_eq!(client.database, Some(2));
        assert!(client.fail_fast);
        assert!(client.tls.is_none());
    }

    #[test]
    fn token_overrides_inline_password() {
        let client = client_config(
            &keydb("redis://:inline@keydb.local:6379", false),
            Some("from-env".into()),
        )
        .unwrap();
        assert_eq!(client.password.as_deref(), Some("from-env"));
    }

    #[test]
    fn tls_endpoint_enables_tls() {
        let client = client_config(&keydb("keydb.local:6380", true), None).unwrap();
        assert!(client.tls.is_some());
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(client_config(&keydb("keydb.local:http", false), None).is_err());
    }

    #[test]
    fn credentials_are_redacted() {
        assert_eq!(
            redact("redis://:secret@keydb.local:6379/1"),
            "redis://***@keydb.local:6379/1"
        );
        assert_eq!(redact("redis://keydb.local"), "redis://keydb.local");
    }
}
