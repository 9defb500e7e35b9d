use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::ops::Deref;
use std::time::Duration;
use tracing::{debug, warn};

use super::pool::PooledConnection;

/// How long a connection waits on a locked database before reporting SQLITE_BUSY
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a session's physical connection was opened for it or drawn from the shared pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Explicit,
    Pooled,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Explicit => write!(f, "explicit"),
            ConnectionKind::Pooled => write!(f, "pooled"),
        }
    }
}

/// Open a SQLite connection from a URI or path
pub fn open_connection(url: &str) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;

    debug!("Opening SQLite connection: {}", url);
    let conn = Connection::open_with_flags(url, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // In-memory databases reject WAL and silently keep their own journal mode
    if let Err(e) = conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    ) {
        warn!("Failed to apply connection pragmas: {}", e);
    }

    Ok(conn)
}

/// The physical handle a session holds between acquire and release
pub enum PhysicalConnection {
    Explicit { id: u64, conn: Connection },
    Pooled(PooledConnection),
}

impl PhysicalConnection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            PhysicalConnection::Explicit { .. } => ConnectionKind::Explicit,
            PhysicalConnection::Pooled(_) => ConnectionKind::Pooled,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            PhysicalConnection::Explicit { id, .. } => *id,
            PhysicalConnection::Pooled(pooled) => pooled.id(),
        }
    }

    /// True when the pool this connection came from has been closed or replaced
    pub fn is_stale(&self) -> bool {
        match self {
            PhysicalConnection::Explicit { .. } => false,
            PhysicalConnection::Pooled(pooled) => pooled.is_pool_closed(),
        }
    }

    /// Ask the driver; any error counts as "not open"
    pub fn is_open(&self) -> bool {
        self.query_row("SELECT 1", [], |_| Ok(())).is_ok()
    }

    /// Close the handle. Pooled handles go back to their pool; errors are logged and dropped.
    pub fn close(self) {
        match self {
            PhysicalConnection::Explicit { id, conn } => {
                if let Err((_, e)) = conn.close() {
                    warn!("Failed to close explicit connection {}: {}", id, e);
                }
            }
            PhysicalConnection::Pooled(pooled) => drop(pooled),
        }
    }
}

impl Deref for PhysicalConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            PhysicalConnection::Explicit { conn, .. } => conn,
            PhysicalConnection::Pooled(pooled) => &**pooled,
        }
    }
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}
