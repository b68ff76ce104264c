//! Connection manager
//!
//! Owns every live protocol session. Sessions are pooled per
//! (host, port, username) identity; a checked-out session is owned
//! exclusively by its caller until returned. Pooled sessions are
//! revalidated with NOOP before reuse and capped per identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{EndpointConnector, MailEndpoint};
use crate::config::{EndpointConfig, PoolKey};
use crate::error::{FerryError, Result};

/// Pooled sessions kept per identity before overflow closes them.
const DEFAULT_POOL_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Pooled,
    Error,
    Closed,
}

/// A live session plus its bookkeeping. Owned exclusively by whoever holds
/// the value; returning it to the manager gives ownership back.
pub struct ManagedConnection {
    pub endpoint: Box<dyn MailEndpoint>,
    pub identity: PoolKey,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error_count: u32,
}

impl ManagedConnection {
    fn new(endpoint: Box<dyn MailEndpoint>, identity: PoolKey) -> Self {
        let now = Utc::now();
        Self {
            endpoint,
            identity,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_activity: now,
            error_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record a failed operation on this session.
    pub fn record_error(&mut self) {
        self.error_count += 1;
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .field("connected_at", &self.connected_at)
            .field("last_activity", &self.last_activity)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}

/// Pools and dials sessions for every endpoint the orchestrator touches.
pub struct ConnectionManager {
    connector: Arc<dyn EndpointConnector>,
    pools: Mutex<HashMap<PoolKey, Vec<ManagedConnection>>>,
    capacity: usize,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn EndpointConnector>) -> Self {
        Self::with_capacity(connector, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(connector: Arc<dyn EndpointConnector>, capacity: usize) -> Self {
        Self {
            connector,
            pools: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Returns a healthy session for the config's identity: a revalidated
    /// pooled one if available, otherwise a fresh dial.
    pub async fn get_connection(&self, config: &EndpointConfig) -> Result<ManagedConnection> {
        let key = config.identity();

        loop {
            let candidate = {
                let mut pools = self.pools.lock().await;
                pools.get_mut(&key).and_then(Vec::pop)
            };
            let Some(mut conn) = candidate else { break };

            match conn.endpoint.noop().await {
                Ok(()) => {
                    debug!(identity = %key, "Reusing pooled connection");
                    conn.status = ConnectionStatus::Connected;
                    conn.touch();
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(identity = %key, "Discarding dead pooled connection: {}", e);
                    let _ = conn.endpoint.logout().await;
                }
            }
        }

        info!(identity = %key, "Establishing new connection");
        let endpoint = self.connector.connect(config).await?;
        Ok(ManagedConnection::new(endpoint, key))
    }

    /// Dial with exponential backoff for transport-class failures:
    /// `base_delay * 2^attempt` between tries, bounded by `attempts`.
    /// Authentication failures are surfaced immediately, never retried.
    pub async fn connect_with_backoff(
        &self,
        config: &EndpointConfig,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<ManagedConnection> {
        let key = config.identity();
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.get_connection(config).await {
                Ok(conn) => return Ok(conn),
                Err(e @ FerryError::Auth(_)) => return Err(e),
                Err(e) => {
                    if attempt + 1 < attempts {
                        let delay = base_delay * 2u32.saturating_pow(attempt);
                        warn!(
                            identity = %key,
                            attempt = attempt + 1,
                            "Connect failed ({}), retrying in {:?}",
                            e,
                            delay
                        );
                        last_error = Some(e);
                        tokio::time::sleep(delay).await;
                    } else {
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(FerryError::ReconnectExhausted(format!(
            "max attempts reached for {}: {}",
            key,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string())
        )))
    }

    /// Returns a session to its identity's pool, closing it instead once
    /// the pool is at capacity.
    pub async fn return_to_pool(&self, mut conn: ManagedConnection) {
        conn.touch();
        conn.status = ConnectionStatus::Pooled;

        let overflow = {
            let mut pools = self.pools.lock().await;
            let entries = pools.entry(conn.identity.clone()).or_default();
            if entries.len() < self.capacity {
                debug!(identity = %conn.identity, pooled = entries.len() + 1, "Pooled connection");
                entries.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = overflow {
            debug!(identity = %conn.identity, "Pool full, closing connection");
            Self::close(conn).await;
        }
    }

    /// Close one session. Idempotent; close-time errors are logged and
    /// swallowed since the resource is being discarded regardless.
    pub async fn close_connection(&self, conn: ManagedConnection) {
        Self::close(conn).await;
    }

    async fn close(mut conn: ManagedConnection) {
        if let Err(e) = conn.endpoint.logout().await {
            debug!(identity = %conn.identity, "Ignoring close-time error: {}", e);
        }
        conn.status = ConnectionStatus::Closed;
    }

    /// Close every pooled session.
    pub async fn close_all(&self) {
        let drained: Vec<ManagedConnection> = {
            let mut pools = self.pools.lock().await;
            pools.drain().flat_map(|(_, conns)| conns).collect()
        };
        let count = drained.len();
        for conn in drained {
            Self::close(conn).await;
        }
        if count > 0 {
            info!("Closed {} pooled connections", count);
        }
    }

    /// Side-effect-free probe: connect, authenticate, disconnect. Nothing
    /// is left in any pool.
    pub async fn test_connection(&self, config: &EndpointConfig) -> Result<()> {
        let mut endpoint = self.connector.connect(config).await?;
        let _ = endpoint.logout().await;
        Ok(())
    }

    /// Number of pooled (idle) sessions for an identity.
    pub async fn pooled_count(&self, key: &PoolKey) -> usize {
        let pools = self.pools.lock().await;
        pools.get(key).map(Vec::len).unwrap_or(0)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryConnector, MemoryMailbox};
    use crate::config::AuthMethod;

    fn config(host: &str) -> EndpointConfig {
        EndpointConfig {
            host: host.to_string(),
            port: 143,
            tls: false,
            username: "user".to_string(),
            auth: AuthMethod::Password {
                password: "secret".to_string(),
            },
            connect_timeout_secs: 5,
        }
    }

    fn manager_with(host: &str) -> (Arc<MemoryConnector>, ConnectionManager, MemoryMailbox) {
        let mailbox = MemoryMailbox::new();
        let connector = Arc::new(MemoryConnector::new());
        connector.register(host, mailbox.clone());
        let manager = ConnectionManager::new(connector.clone());
        (connector, manager, mailbox)
    }

    #[tokio::test]
    async fn test_pooled_connection_is_reused() {
        let (connector, manager, _) = manager_with("a.example.com");
        let config = config("a.example.com");

        let conn = manager.get_connection(&config).await.unwrap();
        manager.return_to_pool(conn).await;
        assert_eq!(manager.pooled_count(&config.identity()).await, 1);

        let _conn = manager.get_connection(&config).await.unwrap();
        assert_eq!(manager.pooled_count(&config.identity()).await, 0);
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_capacity_cap() {
        let mailbox = MemoryMailbox::new();
        let connector = Arc::new(MemoryConnector::new());
        connector.register("a.example.com", mailbox);
        let manager = ConnectionManager::with_capacity(connector, 1);
        let config = config("a.example.com");

        let first = manager.get_connection(&config).await.unwrap();
        let second = manager.get_connection(&config).await.unwrap();
        manager.return_to_pool(first).await;
        manager.return_to_pool(second).await;

        // second return overflowed and was closed
        assert_eq!(manager.pooled_count(&config.identity()).await, 1);
    }

    #[tokio::test]
    async fn test_dead_pooled_connection_is_discarded() {
        let (connector, manager, mailbox) = manager_with("a.example.com");
        let config = config("a.example.com");

        let conn = manager.get_connection(&config).await.unwrap();
        manager.return_to_pool(conn).await;

        // the pooled session dies while idle
        mailbox.fail_noop(true);
        let conn = manager.get_connection(&config).await;
        // revalidation discarded the dead one and dialed again
        assert!(conn.is_ok());
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_identities_never_share_pools() {
        let mailbox = MemoryMailbox::new();
        let connector = Arc::new(MemoryConnector::new());
        connector.register("a.example.com", mailbox.clone());
        connector.register("b.example.com", mailbox);
        let manager = ConnectionManager::new(connector);

        let conn = manager.get_connection(&config("a.example.com")).await.unwrap();
        manager.return_to_pool(conn).await;

        assert_eq!(
            manager.pooled_count(&config("a.example.com").identity()).await,
            1
        );
        assert_eq!(
            manager.pooled_count(&config("b.example.com").identity()).await,
            0
        );
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (connector, manager, _) = manager_with("a.example.com");
        connector.reject_auth("a.example.com");

        let err = manager
            .connect_with_backoff(&config("a.example.com"), 5, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
        assert_eq!(connector.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_backoff_exhaustion() {
        let (_, manager, _) = manager_with("a.example.com");
        // never registered host -> connection error every attempt
        let err = manager
            .connect_with_backoff(&config("missing.example.com"), 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RECONNECT_EXHAUSTED");
    }

    #[tokio::test]
    async fn test_probe_leaves_no_residue() {
        let (_, manager, _) = manager_with("a.example.com");
        let config = config("a.example.com");

        manager.test_connection(&config).await.unwrap();
        assert_eq!(manager.pooled_count(&config.identity()).await, 0);
    }
}
