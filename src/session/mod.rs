// Session lifecycle: pooling, physical connections, autodisconnect and the caller registry
pub mod autodisconnect;
pub mod connection_pool;
pub mod physical;
pub mod pool;
pub mod registry;
pub mod state;

pub use autodisconnect::{AutodisconnectCoordinator, ReleaseEvent};
pub use connection_pool::ConnectionPool;
pub use physical::{ConnectionKind, PhysicalConnection, open_connection};
pub use pool::{PoolStats, PooledConnection, SqlitePool};
pub use registry::{CallerId, SessionHandle, SessionRegistry};
pub use state::{Session, SessionEvent, SessionObserver};
