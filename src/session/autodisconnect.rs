use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Events after which a pooled session may hand its physical connection back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEvent {
    /// A cursor ran past its last row
    EndOfCursor,
    /// A statement completed without producing a cursor
    NoResultSet,
    Commit,
    Rollback,
    AutocommitOn,
}

impl ReleaseEvent {
    /// Transactional events conclude a unit of work by definition
    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            ReleaseEvent::Commit | ReleaseEvent::Rollback | ReleaseEvent::AutocommitOn
        )
    }
}

/// Decides when a session releases its physical connection.
///
/// Clones share the pool's autodisconnect switch, so a change made through the context
/// applies to sessions created earlier. The session's autocommit flag is passed in per event.
#[derive(Debug, Clone)]
pub struct AutodisconnectCoordinator {
    pool_auto_disconnect: Arc<AtomicBool>,
}

impl AutodisconnectCoordinator {
    pub fn new(pool_auto_disconnect: bool) -> Self {
        AutodisconnectCoordinator {
            pool_auto_disconnect: Arc::new(AtomicBool::new(pool_auto_disconnect)),
        }
    }

    /// Explicit connections are never autodisconnected
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.pool_auto_disconnect.load(Ordering::Acquire)
    }

    /// Flip the switch for every clone of this coordinator
    pub fn set_enabled(&self, enabled: bool) {
        self.pool_auto_disconnect.store(enabled, Ordering::Release);
    }

    /// Whether `event` should release the physical connection.
    ///
    /// Non-transactional events release only outside a transaction, so a statement that
    /// returns no rows mid-transaction keeps its connection. Transactional events release
    /// regardless of the autocommit flag.
    pub fn should_release(&self, event: ReleaseEvent, autocommit_enabled: bool) -> bool {
        if event.is_transactional() {
            self.is_enabled()
        } else {
            self.is_enabled() && autocommit_enabled
        }
    }
}
