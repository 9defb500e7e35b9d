use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::autodisconnect::{AutodisconnectCoordinator, ReleaseEvent};
use super::physical::{ConnectionKind, PhysicalConnection};
use super::registry::CallerId;
use crate::query::{ExecMode, Execution, StatementExecution};
use crate::types::{Row, Value};
use crate::{Result, SqlSessionError};

/// Lifecycle notifications a session sends to whoever created it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session was closed for good and must be forgotten
    Close,
    /// The physical connection was released; the session lives on
    AutoDisconnect,
}

/// Callback installed by the registry when it creates a session
pub type SessionObserver = Arc<dyn Fn(&CallerId, Uuid, SessionEvent) + Send + Sync>;

/// One caller's logical connection.
///
/// Outlives its physical connection: a pooled session may release and reacquire its
/// handle many times while staying registered. Holds at most one statement; creating a
/// new one closes the previous one and its cursor.
pub struct Session {
    id: Uuid,
    caller: CallerId,
    kind: ConnectionKind,
    connection: Option<PhysicalConnection>,
    statement: Option<StatementExecution>,
    autocommit: bool,
    /// Connection that ran the `BEGIN` of the open transaction
    transaction_connection: Option<u64>,
    coordinator: AutodisconnectCoordinator,
    observer: SessionObserver,
    current_database: Option<String>,
    closed: bool,
}

impl Session {
    pub fn new(
        caller: CallerId,
        connection: PhysicalConnection,
        coordinator: AutodisconnectCoordinator,
        observer: SessionObserver,
    ) -> Self {
        let session = Session {
            id: Uuid::new_v4(),
            caller,
            kind: connection.kind(),
            connection: Some(connection),
            statement: None,
            autocommit: true,
            transaction_connection: None,
            coordinator,
            observer,
            current_database: None,
            closed: false,
        };
        info!(
            "Created {} session {} for caller {}",
            session.kind, session.id, session.caller
        );
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_pooled(&self) -> bool {
        self.kind == ConnectionKind::Pooled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True iff a physical handle is present and the driver answers on it
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| !conn.is_stale() && conn.is_open())
    }

    /// True when the handle is absent or belongs to a pool that has been replaced
    pub fn needs_connection(&self) -> bool {
        self.connection.as_ref().is_none_or(PhysicalConnection::is_stale)
    }

    /// Install a freshly acquired physical connection
    pub fn attach(&mut self, connection: PhysicalConnection) {
        debug!(
            "Session {} attached to connection {}",
            self.id,
            connection.id()
        );
        if let Some(previous) = self.connection.replace(connection) {
            previous.close();
        }
    }

    pub fn connection(&self) -> Result<&PhysicalConnection> {
        self.connection.as_ref().ok_or(SqlSessionError::NoActiveConnection)
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(PhysicalConnection::id)
    }

    /// Close the statement and the physical handle, then tell the observer to forget
    /// this session. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.close_statement();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.closed = true;
        info!("Closed session {} for caller {}", self.id, self.caller);
        (self.observer)(&self.caller, self.id, SessionEvent::Close);
    }

    /// Release only the physical handle; the statement, its buffered cursor and the
    /// registration stay. Idempotent.
    pub fn auto_disconnect(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        debug!(
            "Session {} released connection {}",
            self.id,
            connection.id()
        );
        connection.close();
        (self.observer)(&self.caller, self.id, SessionEvent::AutoDisconnect);
    }

    fn close_statement(&mut self) {
        if let Some(mut statement) = self.statement.take() {
            statement.close();
        }
    }

    /// Replace the current statement with a new one prepared on the physical handle
    pub fn create_statement(&mut self, sql: &str, params: Vec<Value>) -> Result<&mut StatementExecution> {
        self.close_statement();
        let connection = self.connection()?;
        let statement = StatementExecution::prepare(connection, sql, params)?;
        Ok(self.statement.insert(statement))
    }

    /// Create and run a statement. Returns whether it opened a cursor.
    ///
    /// A failed execution leaves the session without a statement. Outside a transaction it
    /// also finishes the unit of work, so a pooled connection goes back to the pool.
    pub fn execute(&mut self, sql: &str, params: Vec<Value>, mode: ExecMode) -> Result<bool> {
        match self.run_statement(sql, params, mode) {
            Ok(execution) => {
                if let Some(event) = execution.event {
                    self.notify(event);
                }
                Ok(execution.has_cursor)
            }
            Err(e) => {
                self.close_statement();
                self.notify(ReleaseEvent::NoResultSet);
                Err(e)
            }
        }
    }

    fn run_statement(&mut self, sql: &str, params: Vec<Value>, mode: ExecMode) -> Result<Execution> {
        self.begin_if_needed()?;
        self.create_statement(sql, params)?;

        let (Some(statement), Some(connection)) = (self.statement.as_mut(), self.connection.as_ref()) else {
            return Err(SqlSessionError::NoActiveConnection);
        };
        statement.execute(connection, mode)
    }

    /// Open a driver transaction before a statement when autocommit is off
    fn begin_if_needed(&mut self) -> Result<()> {
        if self.autocommit {
            return Ok(());
        }
        if self.transaction_lost() {
            return Err(lost_transaction());
        }
        let connection = self.connection()?;
        if connection.is_autocommit() {
            let id = connection.id();
            connection
                .execute_batch("BEGIN")
                .map_err(SqlSessionError::transaction)?;
            self.transaction_connection = Some(id);
        }
        Ok(())
    }

    /// The connection that began the open transaction was released, which rolled it back
    fn transaction_lost(&self) -> bool {
        match (self.transaction_connection, &self.connection) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(id), Some(connection)) => connection.id() != id,
        }
    }

    pub fn fetch_row(&mut self) -> Row {
        let row = self
            .statement
            .as_mut()
            .map(StatementExecution::fetch_row)
            .unwrap_or_default();
        self.after_fetch();
        row
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        let rows = self
            .statement
            .as_mut()
            .map(StatementExecution::fetch_all)
            .unwrap_or_default();
        self.after_fetch();
        rows
    }

    fn after_fetch(&mut self) {
        let ended = self
            .statement
            .as_mut()
            .is_some_and(StatementExecution::take_end_of_cursor);
        if ended {
            self.notify(ReleaseEvent::EndOfCursor);
        }
    }

    pub fn is_row_available(&self) -> bool {
        self.statement
            .as_ref()
            .is_some_and(StatementExecution::is_row_available)
    }

    pub fn row_count(&self) -> Option<usize> {
        self.statement.as_ref().and_then(StatementExecution::row_count)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.statement
            .as_ref()
            .map(StatementExecution::column_names)
            .unwrap_or_default()
    }

    pub fn statement(&self) -> Option<&StatementExecution> {
        self.statement.as_ref()
    }

    pub fn start_transaction(&mut self) -> Result<()> {
        self.autocommit_off()
    }

    pub fn autocommit_off(&mut self) -> Result<()> {
        self.autocommit = false;
        Ok(())
    }

    /// Switch back to autocommit, committing any open transaction.
    ///
    /// If that transaction was already rolled back by a released connection the switch
    /// still happens, but the lost work is reported as an error.
    pub fn autocommit_on(&mut self) -> Result<()> {
        if self.transaction_lost() {
            self.transaction_connection = None;
            self.autocommit = true;
            self.notify(ReleaseEvent::AutocommitOn);
            return Err(lost_transaction());
        }
        if let Some(connection) = &self.connection {
            if !connection.is_autocommit() {
                connection
                    .execute_batch("COMMIT")
                    .map_err(SqlSessionError::transaction)?;
            }
        }
        self.transaction_connection = None;
        self.autocommit = true;
        self.notify(ReleaseEvent::AutocommitOn);
        Ok(())
    }

    pub fn autocommit_enabled(&self) -> bool {
        self.autocommit
    }

    pub fn commit(&mut self) -> Result<()> {
        self.end_transaction("COMMIT", ReleaseEvent::Commit)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.end_transaction("ROLLBACK", ReleaseEvent::Rollback)
    }

    fn end_transaction(&mut self, command: &str, event: ReleaseEvent) -> Result<()> {
        if self.autocommit {
            return Err(SqlSessionError::Transaction(format!(
                "{command} requested while autocommit is enabled"
            )));
        }
        if self.transaction_lost() {
            self.transaction_connection = None;
            self.notify(event);
            // The work is gone either way; only a commit has to say so
            return match event {
                ReleaseEvent::Rollback => Ok(()),
                _ => Err(lost_transaction()),
            };
        }
        // Nothing ran since the last transaction ended: nothing to finish
        if let Some(connection) = &self.connection {
            if !connection.is_autocommit() {
                connection
                    .execute_batch(command)
                    .map_err(SqlSessionError::transaction)?;
            }
        }
        self.transaction_connection = None;
        self.notify(event);
        Ok(())
    }

    fn notify(&mut self, event: ReleaseEvent) {
        if self.coordinator.should_release(event, self.autocommit) {
            debug!("Session {}: {:?} releases its connection", self.id, event);
            self.auto_disconnect();
        }
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current_database.as_deref()
    }

    pub fn set_current_database(&mut self, name: &str) {
        self.current_database = Some(name.to_string());
    }
}

fn lost_transaction() -> SqlSessionError {
    SqlSessionError::Transaction(
        "transaction was rolled back when its connection was released".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::open_connection;
    use parking_lot::Mutex;

    fn recording_observer() -> (SessionObserver, Arc<Mutex<Vec<SessionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer: SessionObserver =
            Arc::new(move |_: &CallerId, _: Uuid, event: SessionEvent| sink.lock().push(event));
        (observer, events)
    }

    fn explicit_session(coordinator: AutodisconnectCoordinator) -> (Session, Arc<Mutex<Vec<SessionEvent>>>) {
        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2);")
            .unwrap();
        let (observer, events) = recording_observer();
        let session = Session::new(
            CallerId::from("agent-1"),
            PhysicalConnection::Explicit { id: 1, conn },
            coordinator,
            observer,
        );
        (session, events)
    }

    #[test]
    fn test_close_is_idempotent_and_notifies_once() {
        let (mut session, events) = explicit_session(AutodisconnectCoordinator::disabled());
        session.close();
        session.close();
        assert!(!session.is_connected());
        assert_eq!(*events.lock(), vec![SessionEvent::Close]);
    }

    #[test]
    fn test_auto_disconnect_without_handle_is_noop() {
        let (mut session, events) = explicit_session(AutodisconnectCoordinator::disabled());
        session.auto_disconnect();
        session.auto_disconnect();
        assert!(!session.is_connected());
        assert!(session.needs_connection());
        assert_eq!(*events.lock(), vec![SessionEvent::AutoDisconnect]);
    }

    #[test]
    fn test_update_releases_when_enabled() {
        let (mut session, events) = explicit_session(AutodisconnectCoordinator::new(true));
        let has_cursor = session
            .execute("UPDATE t SET v = v + 1", vec![], ExecMode::Direct)
            .unwrap();
        assert!(!has_cursor);
        assert_eq!(session.row_count(), Some(2));
        assert!(!session.is_connected());
        assert_eq!(*events.lock(), vec![SessionEvent::AutoDisconnect]);
    }

    #[test]
    fn test_commit_with_autocommit_enabled_is_rejected() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        assert!(matches!(session.commit(), Err(SqlSessionError::Transaction(_))));
        assert!(matches!(session.rollback(), Err(SqlSessionError::Transaction(_))));
    }

    #[test]
    fn test_rollback_discards_work() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        session.start_transaction().unwrap();
        session
            .execute("DELETE FROM t", vec![], ExecMode::Direct)
            .unwrap();
        assert!(!session.connection().unwrap().is_autocommit());
        session.rollback().unwrap();

        session
            .execute("SELECT COUNT(*) FROM t", vec![], ExecMode::Direct)
            .unwrap();
        assert_eq!(session.fetch_row(), vec![Value::Number(2.0)]);
    }

    #[test]
    fn test_failed_execution_clears_statement() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        session.execute("SELECT v FROM t", vec![], ExecMode::Direct).unwrap();
        assert!(session.is_row_available());

        let err = session
            .execute("SELECT v FROM t", vec![], ExecMode::Update)
            .unwrap_err();
        assert!(matches!(err, SqlSessionError::Statement(_)));
        assert!(session.statement().is_none());
        assert!(!session.is_row_available());
        assert!(session.fetch_row().is_empty());
    }

    #[test]
    fn test_failed_execution_releases_outside_transaction() {
        let (mut session, events) = explicit_session(AutodisconnectCoordinator::new(true));
        assert!(session.execute("SELEKT 1", vec![], ExecMode::Direct).is_err());
        assert!(!session.is_connected());
        assert_eq!(*events.lock(), vec![SessionEvent::AutoDisconnect]);
    }

    #[test]
    fn test_released_transaction_fails_commit() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        session.start_transaction().unwrap();
        session
            .execute("DELETE FROM t", vec![], ExecMode::Direct)
            .unwrap();
        session.auto_disconnect();

        let conn = open_connection(":memory:").unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
        session.attach(PhysicalConnection::Explicit { id: 2, conn });

        assert!(matches!(
            session.execute("DELETE FROM t", vec![], ExecMode::Direct),
            Err(SqlSessionError::Transaction(_))
        ));
        assert!(session.connection().unwrap().is_autocommit());
        assert!(matches!(session.commit(), Err(SqlSessionError::Transaction(_))));

        // Reported once; the next transaction runs on the new connection
        assert!(!session.autocommit_enabled());
        session.execute("INSERT INTO t VALUES (7)", vec![], ExecMode::Direct).unwrap();
        session.commit().unwrap();
        assert!(session.connection().unwrap().is_autocommit());
    }

    #[test]
    fn test_rollback_clears_released_transaction() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        session.autocommit_off().unwrap();
        session
            .execute("UPDATE t SET v = 0", vec![], ExecMode::Direct)
            .unwrap();
        session.auto_disconnect();

        session.rollback().unwrap();
        session.commit().unwrap();
        assert!(matches!(
            session.execute("SELECT 1", vec![], ExecMode::Direct),
            Err(SqlSessionError::NoActiveConnection)
        ));
    }

    #[test]
    fn test_sql_commit_inside_transaction_is_not_a_lost_transaction() {
        let (mut session, _) = explicit_session(AutodisconnectCoordinator::disabled());
        session.autocommit_off().unwrap();
        session
            .execute("INSERT INTO t VALUES (3)", vec![], ExecMode::Direct)
            .unwrap();
        session.execute("COMMIT", vec![], ExecMode::Direct).unwrap();
        session
            .execute("INSERT INTO t VALUES (4)", vec![], ExecMode::Direct)
            .unwrap();
        session.rollback().unwrap();

        session
            .execute("SELECT COUNT(*) FROM t", vec![], ExecMode::Direct)
            .unwrap();
        assert_eq!(session.fetch_row(), vec![Value::Number(3.0)]);
    }
}
