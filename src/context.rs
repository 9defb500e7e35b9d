use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ConfigAspect, ConfigurationStore, ConnectionSettings, PoolSettings};
use crate::dialect::{Dialect, SqliteDialect};
use crate::query::ExecMode;
use crate::session::{
    AutodisconnectCoordinator, CallerId, ConnectionPool, PhysicalConnection, PoolStats, Session,
    SessionHandle, SessionRegistry, open_connection,
};
use crate::types::{Row, Value};
use crate::{Result, SqlSessionError};

/// How [`SqlContext::connect`] obtains a physical connection
#[derive(Debug, Clone)]
pub enum ConnectParams {
    /// Open a connection owned by the caller alone; never autodisconnected
    Explicit(ConnectionSettings),
    /// Draw from the shared pool configured through `defaultconnection`
    Pooled,
}

/// Environment object owning the configuration, the pool and every caller's session.
///
/// Construct one per application (or per test) and call [`SqlContext::shutdown`] when
/// done. Every operation is keyed by the caller's identity.
pub struct SqlContext {
    dialect: Arc<dyn Dialect>,
    store: RwLock<ConfigurationStore>,
    pool: ConnectionPool,
    registry: SessionRegistry,
    autodisconnect: AutodisconnectCoordinator,
}

impl SqlContext {
    pub fn new() -> Self {
        Self::with_dialect(Arc::new(SqliteDialect))
    }

    pub fn with_dialect(dialect: Arc<dyn Dialect>) -> Self {
        SqlContext {
            dialect,
            store: RwLock::new(ConfigurationStore::new()),
            pool: ConnectionPool::new(),
            registry: SessionRegistry::new(),
            autodisconnect: AutodisconnectCoordinator::new(
                ConnectionSettings::default().autodisconnect,
            ),
        }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Apply one configuration aspect.
    ///
    /// Once pooling is enabled and a database is known, a change of target or pool
    /// settings replaces the live pool and takes pooled connections away from idle sessions.
    pub fn configure(&self, aspect: &str, values: &HashMap<String, String>) -> Result<()> {
        let mut store = self.store.write();
        let mut candidate = store.clone();
        let aspect = candidate.configure(aspect, values)?;
        if aspect == ConfigAspect::DefaultConnection
            && candidate.connection().brand != self.dialect.brand()
        {
            return Err(SqlSessionError::Configuration(format!(
                "unsupported database brand '{}', expected '{}'",
                candidate.connection().brand,
                self.dialect.brand()
            )));
        }
        self.apply(&mut store, candidate)?;
        info!("Applied configuration aspect {}", aspect);
        Ok(())
    }

    /// Replace the pool settings. Invalid settings fail before any connection is opened.
    pub fn reconfigure(&self, settings: PoolSettings) -> Result<()> {
        let mut store = self.store.write();
        let mut candidate = store.clone();
        candidate.set_pool(settings)?;
        self.apply(&mut store, candidate)
    }

    fn apply(&self, store: &mut ConfigurationStore, candidate: ConfigurationStore) -> Result<()> {
        if candidate.pooling_enabled() && candidate.connection().database.is_some() {
            let url = self.dialect.build_url(candidate.connection())?;
            let target_changed = !store.pooling_enabled()
                || store.connection().database != candidate.connection().database
                || store.pool() != candidate.pool();
            if target_changed || !self.pool.is_initialized() {
                self.pool.reconfigure(&url, candidate.pool())?;
                self.registry.release_pooled();
            }
        }
        self.autodisconnect
            .set_enabled(candidate.connection().autodisconnect);
        *store = candidate;
        Ok(())
    }

    /// Pooled sessions share one switch, so `autodisconnect` changes reach existing sessions
    fn coordinator(&self) -> AutodisconnectCoordinator {
        self.autodisconnect.clone()
    }

    /// Make sure the pool exists before a pooled session needs it
    fn ensure_pool(&self) -> Result<()> {
        if self.pool.is_initialized() {
            return Ok(());
        }
        // Write lock serializes first use, so only one caller builds the pool
        let store = self.store.write();
        if self.pool.is_initialized() {
            return Ok(());
        }
        if !store.pooling_enabled() {
            return Err(SqlSessionError::Configuration(
                "pooled connections need a defaultconnection configuration".to_string(),
            ));
        }
        let url = self.dialect.build_url(store.connection())?;
        self.pool.reconfigure(&url, store.pool())
    }

    pub async fn connect(&self, caller: &CallerId, params: ConnectParams) -> Result<()> {
        match params {
            ConnectParams::Explicit(settings) => {
                let url = self.dialect.build_url(&settings)?;
                let conn = open_connection(&url)
                    .map_err(|e| SqlSessionError::ConnectionFailure(e.to_string()))?;

                if let Some(existing) = self.registry.get(caller) {
                    debug!("Caller {} reconnects explicitly; closing session {}", caller, existing.id());
                    existing.lock().await.close();
                }

                let session = Session::new(
                    caller.clone(),
                    PhysicalConnection::Explicit {
                        id: self.pool.next_connection_id(),
                        conn,
                    },
                    AutodisconnectCoordinator::disabled(),
                    self.registry.observer(),
                );
                self.registry.register(session);
                Ok(())
            }
            ConnectParams::Pooled => {
                self.pooled_session(caller).await?;
                Ok(())
            }
        }
    }

    async fn pooled_session(&self, caller: &CallerId) -> Result<SessionHandle> {
        if let Some(handle) = self.registry.get(caller) {
            return Ok(handle);
        }
        self.ensure_pool()?;
        self.registry
            .get_or_create_pooled(caller, &self.pool, self.coordinator())
            .await
    }

    /// The caller's session, created from the pool when pooling is enabled
    async fn session(&self, caller: &CallerId) -> Result<SessionHandle> {
        if let Some(handle) = self.registry.get(caller) {
            return Ok(handle);
        }
        if !self.store.read().pooling_enabled() {
            return Err(SqlSessionError::NoActiveConnection);
        }
        self.pooled_session(caller).await
    }

    fn existing(&self, caller: &CallerId) -> Result<SessionHandle> {
        self.registry
            .get(caller)
            .ok_or(SqlSessionError::NoActiveConnection)
    }

    /// Give a pooled session a usable physical connection before it talks to the driver
    async fn ready(&self, session: &mut Session) -> Result<()> {
        if session.is_pooled() && session.needs_connection() {
            let pooled = self.pool.acquire_default().await?;
            session.attach(PhysicalConnection::Pooled(pooled));
        }
        Ok(())
    }

    /// Close the caller's session for good. Idempotent.
    pub async fn disconnect(&self, caller: &CallerId) {
        if let Some(handle) = self.registry.get(caller) {
            handle.lock().await.close();
        }
    }

    /// Logically connected: registered, and either physically connected or pooled
    pub async fn is_connected(&self, caller: &CallerId) -> bool {
        match self.registry.get(caller) {
            Some(handle) => {
                let session = handle.lock().await;
                session.is_pooled() || session.is_connected()
            }
            None => false,
        }
    }

    pub async fn is_physically_connected(&self, caller: &CallerId) -> bool {
        match self.registry.get(caller) {
            Some(handle) => handle.lock().await.is_connected(),
            None => false,
        }
    }

    /// Run `sql` for `caller`. Returns whether a cursor was opened.
    pub async fn execute(
        &self,
        caller: &CallerId,
        sql: &str,
        params: Vec<Value>,
        mode: ExecMode,
    ) -> Result<bool> {
        let handle = self.session(caller).await?;
        let mut session = handle.lock().await;
        self.ready(&mut session).await?;
        session.execute(sql, params, mode)
    }

    pub async fn fetch_row(&self, caller: &CallerId) -> Result<Row> {
        let handle = self.existing(caller)?;
        let row = handle.lock().await.fetch_row();
        Ok(row)
    }

    pub async fn fetch_all(&self, caller: &CallerId) -> Result<Vec<Row>> {
        let handle = self.existing(caller)?;
        let rows = handle.lock().await.fetch_all();
        Ok(rows)
    }

    pub async fn row_available(&self, caller: &CallerId) -> bool {
        match self.registry.get(caller) {
            Some(handle) => handle.lock().await.is_row_available(),
            None => false,
        }
    }

    pub async fn row_count(&self, caller: &CallerId) -> Result<Option<usize>> {
        let handle = self.existing(caller)?;
        let count = handle.lock().await.row_count();
        Ok(count)
    }

    pub async fn column_names(&self, caller: &CallerId) -> Result<Vec<String>> {
        let handle = self.existing(caller)?;
        let names = handle.lock().await.column_names();
        Ok(names)
    }

    pub async fn start_transaction(&self, caller: &CallerId) -> Result<()> {
        let handle = self.session(caller).await?;
        handle.lock().await.start_transaction()
    }

    pub async fn commit(&self, caller: &CallerId) -> Result<()> {
        let handle = self.existing(caller)?;
        handle.lock().await.commit()
    }

    pub async fn rollback(&self, caller: &CallerId) -> Result<()> {
        let handle = self.existing(caller)?;
        handle.lock().await.rollback()
    }

    pub async fn autocommit_on(&self, caller: &CallerId) -> Result<()> {
        let handle = self.existing(caller)?;
        handle.lock().await.autocommit_on()
    }

    pub async fn autocommit_off(&self, caller: &CallerId) -> Result<()> {
        let handle = self.session(caller).await?;
        handle.lock().await.autocommit_off()
    }

    pub async fn autocommit_enabled(&self, caller: &CallerId) -> Result<bool> {
        let handle = self.existing(caller)?;
        let enabled = handle.lock().await.autocommit_enabled();
        Ok(enabled)
    }

    pub async fn use_database(&self, caller: &CallerId, schema: &str) -> Result<()> {
        let handle = self.session(caller).await?;
        let mut session = handle.lock().await;
        self.ready(&mut session).await?;
        self.dialect.use_database(&mut session, schema)
    }

    pub async fn find_database(&self, caller: &CallerId, schema: &str) -> Result<bool> {
        let handle = self.session(caller).await?;
        let mut session = handle.lock().await;
        self.ready(&mut session).await?;
        self.dialect.find_database(&session, schema)
    }

    pub async fn current_database(&self, caller: &CallerId) -> Result<String> {
        let handle = self.existing(caller)?;
        let session = handle.lock().await;
        Ok(self.dialect.current_database(&session))
    }

    /// Identifier of the physical connection the caller holds right now, if any
    pub async fn connection_id(&self, caller: &CallerId) -> Option<u64> {
        match self.registry.get(caller) {
            Some(handle) => handle.lock().await.connection_id(),
            None => None,
        }
    }

    pub fn pool_status(&self) -> Option<PoolStats> {
        self.pool.status()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }

    /// Close every session, then the pool
    pub async fn shutdown(&self) {
        self.close_all().await;
        self.pool.shutdown();
        info!("Session context shut down");
    }
}

impl Default for SqlContext {
    fn default() -> Self {
        Self::new()
    }
}
