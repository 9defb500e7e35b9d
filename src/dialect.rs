use tracing::debug;

use crate::config::ConnectionSettings;
use crate::session::Session;
use crate::{Result, SqlSessionError};

/// Brand-specific helpers the session layer calls without knowing the database
pub trait Dialect: Send + Sync {
    fn brand(&self) -> &'static str;

    fn default_driver(&self) -> &'static str;

    /// Connection URL for `settings`
    fn build_url(&self, settings: &ConnectionSettings) -> Result<String>;

    /// Make `schema` the session's active database
    fn use_database(&self, session: &mut Session, schema: &str) -> Result<()>;

    fn find_database(&self, session: &Session, schema: &str) -> Result<bool>;

    fn current_database(&self, session: &Session) -> String;
}

/// SQLite: databases are the schemas attached to a connection (`main`, `temp`, ...)
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

const MAIN_SCHEMA: &str = "main";

impl Dialect for SqliteDialect {
    fn brand(&self) -> &'static str {
        "sqlite"
    }

    fn default_driver(&self) -> &'static str {
        "rusqlite"
    }

    fn build_url(&self, settings: &ConnectionSettings) -> Result<String> {
        if settings.brand != self.brand() {
            return Err(SqlSessionError::Configuration(format!(
                "unsupported database brand '{}'",
                settings.brand
            )));
        }
        let database = settings.database()?;
        if database.starts_with("file:") {
            return Ok(database.to_string());
        }
        Ok(format!("file:{}", escape_uri_path(database)))
    }

    fn use_database(&self, session: &mut Session, schema: &str) -> Result<()> {
        if session.is_pooled() {
            return Err(SqlSessionError::UnsupportedOperation {
                operation: "use-database".to_string(),
                kind: session.kind(),
            });
        }
        if !self.find_database(session, schema)? {
            return Err(SqlSessionError::Statement(format!(
                "unknown database '{schema}'"
            )));
        }
        debug!("Session {} now uses database {}", session.id(), schema);
        session.set_current_database(schema);
        Ok(())
    }

    fn find_database(&self, session: &Session, schema: &str) -> Result<bool> {
        let conn = session.connection()?;
        let mut stmt = conn
            .prepare("PRAGMA database_list")
            .map_err(SqlSessionError::statement)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(SqlSessionError::statement)?;
        for name in names {
            if name.map_err(SqlSessionError::statement)?.eq_ignore_ascii_case(schema) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current_database(&self, session: &Session) -> String {
        session.current_database().unwrap_or(MAIN_SCHEMA).to_string()
    }
}

/// Escape the characters SQLite treats specially in the path part of a URI filename
fn escape_uri_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(c),
        }
    }
    escaped
}
