use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{info, warn};

use super::pool::{PoolStats, PooledConnection, SqlitePool};
use crate::config::PoolSettings;
use crate::{Result, SqlSessionError};

/// Bounded-wait front end over the current [`SqlitePool`].
///
/// The pool itself may be swapped out by [`ConnectionPool::reconfigure`]; callers never
/// see the swap except through [`PooledConnection::is_pool_closed`] on handles they
/// already hold.
pub struct ConnectionPool {
    current: RwLock<Option<Arc<SqlitePool>>>,
    timeout_seconds: AtomicU64,
    connection_ids: Arc<AtomicU64>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            current: RwLock::new(None),
            timeout_seconds: AtomicU64::new(PoolSettings::default().timeout_seconds),
            connection_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate a physical connection id. Shared with every pool generation.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.current.read().is_some()
    }

    /// Validate `settings` and replace the underlying pool with a fresh one over `url`.
    ///
    /// Nothing is opened when validation fails. Idle connections of the old pool are
    /// dropped immediately; its checked-out connections become stale and are dropped when
    /// their sessions release them.
    pub fn reconfigure(&self, url: &str, settings: &PoolSettings) -> Result<()> {
        settings.validate()?;

        let pool = Arc::new(SqlitePool::new(
            url,
            settings.partitions,
            settings.max_connections,
            self.connection_ids.clone(),
        ));
        self.timeout_seconds.store(settings.timeout_seconds, Ordering::Release);

        let previous = self.current.write().replace(pool);
        if let Some(previous) = previous {
            info!("Replacing connection pool for {}", previous.url());
            previous.close();
        }
        Ok(())
    }

    /// Acquire with the configured timeout
    pub async fn acquire_default(&self) -> Result<PooledConnection> {
        self.acquire(self.timeout_seconds.load(Ordering::Acquire)).await
    }

    /// Check out a connection, giving up after `timeout_seconds` (0 waits without bound).
    ///
    /// The underlying acquire runs as its own task. On timeout that task is aborted; if it
    /// had already obtained a connection, dropping its output returns the connection to the
    /// pool, so an abandoned attempt never reaches another caller.
    pub async fn acquire(&self, timeout_seconds: u64) -> Result<PooledConnection> {
        let pool = self
            .current
            .read()
            .clone()
            .ok_or(SqlSessionError::NoActiveConnection)?;

        let mut worker = tokio::spawn(async move { pool.acquire().await });

        if timeout_seconds == 0 {
            return worker.await.map_err(join_failure)?;
        }

        match tokio::time::timeout(Duration::from_secs(timeout_seconds), &mut worker).await {
            Ok(joined) => joined.map_err(join_failure)?,
            Err(_) => {
                worker.abort();
                warn!("Gave up waiting for a pooled connection after {}s", timeout_seconds);
                Err(SqlSessionError::PoolTimeout(timeout_seconds))
            }
        }
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Option<PoolStats> {
        self.current.read().as_ref().map(|pool| pool.stats())
    }

    /// Close the current pool; later acquires fail with `NoActiveConnection`
    pub fn shutdown(&self) {
        if let Some(pool) = self.current.write().take() {
            pool.close();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

fn join_failure(err: JoinError) -> SqlSessionError {
    SqlSessionError::ConnectionFailure(format!("pool acquire task failed: {err}"))
}
