use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::physical::open_connection;
use crate::{Result, SqlSessionError};

/// Bounded, partitioned pool of SQLite connections.
///
/// At most `(max_connections / partitions) * partitions` connections are checked out at
/// once. Connections are opened lazily and parked per partition when returned, so
/// concurrent returns contend on different locks.
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    url: String,
    partitions: Vec<Mutex<Vec<IdleConnection>>>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    next_partition: AtomicUsize,
    connection_ids: Arc<AtomicU64>,
    closed: AtomicBool,
}

struct IdleConnection {
    id: u64,
    conn: Connection,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub partitions: usize,
    pub idle: usize,
    pub in_use: usize,
}

impl SqlitePool {
    /// Create a pool over `url`. `connection_ids` is shared so ids stay unique across pool generations.
    pub fn new(
        url: &str,
        partitions: usize,
        max_connections: usize,
        connection_ids: Arc<AtomicU64>,
    ) -> Self {
        let partitions = partitions.max(1);
        let capacity = (max_connections / partitions) * partitions;

        info!(
            "Creating SQLite pool for {} ({} partitions, {} connections)",
            url, partitions, capacity
        );

        SqlitePool {
            inner: Arc::new(PoolInner {
                url: url.to_string(),
                partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                next_partition: AtomicUsize::new(0),
                connection_ids,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wait for a free slot and check out a connection.
    ///
    /// Cancel-safe: dropping the future before it resolves never consumes a slot.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(SqlSessionError::ConnectionFailure("connection pool is closed".to_string()));
        }

        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SqlSessionError::ConnectionFailure("connection pool is closed".to_string()))?;

        let home = self.inner.next_partition.fetch_add(1, Ordering::Relaxed) % self.inner.partitions.len();

        let (partition, idle) = match self.take_idle(home) {
            Some(found) => found,
            None => {
                let conn = open_connection(&self.inner.url)
                    .map_err(|e| SqlSessionError::ConnectionFailure(e.to_string()))?;
                let id = self.inner.connection_ids.fetch_add(1, Ordering::Relaxed);
                debug!("Opened pooled connection {} in partition {}", id, home);
                (home, IdleConnection { id, conn })
            }
        };

        Ok(PooledConnection {
            id: idle.id,
            conn: Some(idle.conn),
            partition,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Take an idle connection, preferring the home partition
    fn take_idle(&self, home: usize) -> Option<(usize, IdleConnection)> {
        let count = self.inner.partitions.len();
        (0..count)
            .map(|offset| (home + offset) % count)
            .find_map(|partition| self.inner.partitions[partition].lock().pop().map(|idle| (partition, idle)))
    }

    /// Close the pool: wake waiters with an error and drop idle connections.
    /// Checked-out connections are dropped when their holders release them.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();

        let mut dropped = 0;
        for partition in &self.inner.partitions {
            let idle: Vec<IdleConnection> = partition.lock().drain(..).collect();
            dropped += idle.len();
        }
        info!("Closed SQLite pool for {} ({} idle connections dropped)", self.inner.url, dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.partitions.iter().map(|p| p.lock().len()).sum();
        let available = if self.is_closed() {
            self.inner.capacity
        } else {
            self.inner.semaphore.available_permits()
        };
        PoolStats {
            capacity: self.inner.capacity,
            partitions: self.inner.partitions.len(),
            idle,
            in_use: self.inner.capacity.saturating_sub(available),
        }
    }
}

impl Drop for SqlitePool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection checked out from a [`SqlitePool`]. Returned to its partition on drop.
pub struct PooledConnection {
    id: u64,
    conn: Option<Connection>,
    partition: usize,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_pool_closed(&self) -> bool {
        self.pool.closed.load(Ordering::Acquire)
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        // Never hand an open transaction to the next caller
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back pooled connection {} on release: {}", self.id, e);
            }
        }

        let mut idle = self.pool.partitions[self.partition].lock();
        if self.pool.closed.load(Ordering::Acquire) {
            drop(idle);
            debug!("Dropping connection {} released to a closed pool", self.id);
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close pooled connection {}: {}", self.id, e);
            }
            return;
        }
        idle.push(IdleConnection { id: self.id, conn });
        debug!("Returned connection {} to partition {}", self.id, self.partition);
    }
}
