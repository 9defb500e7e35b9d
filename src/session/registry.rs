use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard, TryLockError};
use tracing::{debug, info};
use uuid::Uuid;

use super::autodisconnect::AutodisconnectCoordinator;
use super::connection_pool::ConnectionPool;
use super::physical::PhysicalConnection;
use super::state::{Session, SessionEvent, SessionObserver};
use crate::Result;

/// Opaque identity of one logical caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        CallerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallerId {
    fn from(id: &str) -> Self {
        CallerId(id.to_string())
    }
}

impl From<String> for CallerId {
    fn from(id: String) -> Self {
        CallerId(id)
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared reference to a registered session.
///
/// The session sits behind an async mutex so a caller can hold it across a pool acquire.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    inner: Arc<Mutex<Session>>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        SessionHandle {
            id: session.id(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().await
    }

    pub fn try_lock(&self) -> std::result::Result<MutexGuard<'_, Session>, TryLockError> {
        self.inner.try_lock()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

type SessionMap = HashMap<CallerId, SessionHandle>;

/// Caller id to session map, safe for concurrent callers
pub struct SessionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Callback handed to every session this registry creates. A `Close` removes the
    /// caller's entry, but only while it still points at the closing session.
    pub fn observer(&self) -> SessionObserver {
        let sessions: Weak<RwLock<SessionMap>> = Arc::downgrade(&self.sessions);
        Arc::new(move |caller: &CallerId, id: Uuid, event: SessionEvent| match event {
            SessionEvent::Close => {
                if let Some(sessions) = sessions.upgrade() {
                    remove_matching(&sessions, caller, id);
                }
            }
            SessionEvent::AutoDisconnect => {
                debug!("Session {} of caller {} is physically idle", id, caller);
            }
        })
    }

    pub fn get(&self, caller: &CallerId) -> Option<SessionHandle> {
        self.sessions.read().get(caller).cloned()
    }

    /// Return the caller's session, creating a pooled one if there is none.
    ///
    /// Concurrent first calls for one caller may both acquire; the loser closes its
    /// session (returning the connection) and gets the winner's.
    pub async fn get_or_create_pooled(
        &self,
        caller: &CallerId,
        pool: &ConnectionPool,
        coordinator: AutodisconnectCoordinator,
    ) -> Result<SessionHandle> {
        if let Some(handle) = self.get(caller) {
            return Ok(handle);
        }

        let pooled = pool.acquire_default().await?;
        let session = Session::new(
            caller.clone(),
            PhysicalConnection::Pooled(pooled),
            coordinator,
            self.observer(),
        );
        Ok(self.register(session))
    }

    /// Register `session` unless its caller already has one, in which case the new
    /// session is closed and the existing one is returned.
    pub fn register(&self, mut session: Session) -> SessionHandle {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(session.caller()) {
            let existing = existing.clone();
            drop(sessions);
            debug!(
                "Caller {} already has session {}; discarding {}",
                session.caller(),
                existing.id(),
                session.id()
            );
            session.close();
            return existing;
        }

        let caller = session.caller().clone();
        let handle = SessionHandle::new(session);
        sessions.insert(caller, handle.clone());
        info!("Registered session {} (total sessions: {})", handle.id(), sessions.len());
        handle
    }

    /// Forget the caller's session if it is still `id`. Idempotent.
    pub fn remove(&self, caller: &CallerId, id: Uuid) -> bool {
        remove_matching(&self.sessions, caller, id)
    }

    /// Force every idle pooled session to give its physical connection back. Sessions
    /// busy right now are skipped; they notice the stale handle on their next statement.
    pub fn release_pooled(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        let mut released = 0;
        for handle in handles {
            if let Ok(mut session) = handle.try_lock() {
                if session.is_pooled() && session.connection_id().is_some() {
                    session.auto_disconnect();
                    released += 1;
                }
            }
        }
        debug!("Released {} pooled connection(s)", released);
        released
    }

    /// Close every registered session
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        let count = handles.len();
        for handle in handles {
            handle.lock().await.close();
        }
        self.sessions.write().clear();
        info!("Closed {} session(s)", count);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn callers(&self) -> Vec<CallerId> {
        let mut callers: Vec<CallerId> = self.sessions.read().keys().cloned().collect();
        callers.sort();
        callers
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_matching(sessions: &RwLock<SessionMap>, caller: &CallerId, id: Uuid) -> bool {
    let mut sessions = sessions.write();
    if sessions.get(caller).is_some_and(|handle| handle.id() == id) {
        sessions.remove(caller);
        info!("Removed session {} for caller {} (total sessions: {})", id, caller, sessions.len());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::open_connection;

    fn explicit(registry: &SessionRegistry, caller: &str, id: u64) -> Session {
        let conn = open_connection(":memory:").unwrap();
        Session::new(
            CallerId::from(caller),
            PhysicalConnection::Explicit { id, conn },
            AutodisconnectCoordinator::disabled(),
            registry.observer(),
        )
    }

    #[tokio::test]
    async fn test_close_removes_registration() {
        let registry = SessionRegistry::new();
        let handle = registry.register(explicit(&registry, "a", 1));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&CallerId::from("a")).is_some());

        handle.lock().await.close();
        assert!(registry.is_empty());
        assert!(!registry.remove(&CallerId::from("a"), handle.id()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let registry = SessionRegistry::new();
        let first = registry.register(explicit(&registry, "a", 1));
        let second = registry.register(explicit(&registry, "a", 2));
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(first.lock().await.connection_id(), Some(1));
    }

    #[tokio::test]
    async fn test_stale_close_does_not_remove_newer_session() {
        let registry = SessionRegistry::new();
        let caller = CallerId::from("a");
        let old = registry.register(explicit(&registry, "a", 1));
        assert!(registry.remove(&caller, old.id()));

        let newer = registry.register(explicit(&registry, "a", 2));
        old.lock().await.close();
        assert_eq!(registry.get(&caller).map(|h| h.id()), Some(newer.id()));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        registry.register(explicit(&registry, "a", 1));
        registry.register(explicit(&registry, "b", 2));
        assert_eq!(registry.callers(), vec![CallerId::from("a"), CallerId::from("b")]);

        registry.close_all().await;
        assert!(registry.is_empty());
    }
}
