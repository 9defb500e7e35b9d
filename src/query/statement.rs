use rusqlite::Connection;
use rusqlite::types::Value as SqliteValue;
use tracing::debug;

use super::cursor::RowCursor;
use crate::session::ReleaseEvent;
use crate::types::{Row, Value};
use crate::{Result, SqlSessionError};

/// How a statement is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Unparameterized SQL, any statement kind
    Direct,
    /// Parameterized; opens a cursor when the statement returns rows
    Query,
    /// Parameterized; rejects statements that return rows
    Update,
}

/// What an execution produced, and the release event it raised (if any)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub has_cursor: bool,
    pub event: Option<ReleaseEvent>,
}

#[derive(Debug)]
enum Outcome {
    Cursor(RowCursor),
    RowCount(usize),
}

/// One statement of a session: SQL text, bound parameters and, once executed, either a
/// cursor or an affected-row count.
///
/// A prepared driver statement borrows its connection, so only metadata is kept here and
/// the statement is prepared again when it runs.
#[derive(Debug)]
pub struct StatementExecution {
    sql: String,
    params: Vec<Value>,
    returns_rows: bool,
    outcome: Option<Outcome>,
}

impl StatementExecution {
    /// Compile `sql` to check its syntax and that `params` fills every placeholder
    pub fn prepare(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Self> {
        let stmt = conn.prepare(sql).map_err(SqlSessionError::statement)?;

        let expected = stmt.parameter_count();
        if expected != params.len() {
            return Err(SqlSessionError::Statement(format!(
                "statement has {} placeholder(s) but {} parameter(s) were supplied",
                expected,
                params.len()
            )));
        }

        Ok(StatementExecution {
            sql: sql.to_string(),
            params,
            returns_rows: stmt.column_count() > 0,
            outcome: None,
        })
    }

    pub fn execute(&mut self, conn: &Connection, mode: ExecMode) -> Result<Execution> {
        if mode == ExecMode::Direct && !self.params.is_empty() {
            return Err(SqlSessionError::Statement(
                "direct execution does not take parameters".to_string(),
            ));
        }
        if mode == ExecMode::Update && self.returns_rows {
            return Err(SqlSessionError::Statement(
                "statement produces a result set and cannot run as an update".to_string(),
            ));
        }

        let mut stmt = conn.prepare(&self.sql).map_err(SqlSessionError::statement)?;
        for (index, param) in self.params.iter().enumerate() {
            stmt.raw_bind_parameter(index + 1, param)
                .map_err(SqlSessionError::statement)?;
        }

        let column_count = stmt.column_count();
        if column_count == 0 {
            let affected = stmt.raw_execute().map_err(SqlSessionError::statement)?;
            debug!("Statement affected {} row(s)", affected);
            self.outcome = Some(Outcome::RowCount(affected));
            return Ok(Execution {
                has_cursor: false,
                event: Some(ReleaseEvent::NoResultSet),
            });
        }

        let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let declared_types: Vec<Option<String>> = stmt
            .columns()
            .iter()
            .map(|column| column.decl_type().map(str::to_string))
            .collect();

        let mut buffered = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(SqlSessionError::statement)? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(SqliteValue::from(row.get_ref(i).map_err(SqlSessionError::statement)?));
            }
            buffered.push(values);
        }
        debug!("Opened cursor over {} row(s)", buffered.len());

        let mut cursor = RowCursor::open(column_names, declared_types, buffered);
        let event = cursor.take_end_of_cursor().then_some(ReleaseEvent::EndOfCursor);
        self.outcome = Some(Outcome::Cursor(cursor));
        Ok(Execution {
            has_cursor: true,
            event,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    fn cursor_mut(&mut self) -> Option<&mut RowCursor> {
        match &mut self.outcome {
            Some(Outcome::Cursor(cursor)) => Some(cursor),
            _ => None,
        }
    }

    pub fn has_cursor(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Cursor(_)))
    }

    /// Next row of the cursor; empty when there is no cursor or it is exhausted
    pub fn fetch_row(&mut self) -> Row {
        self.cursor_mut().map(RowCursor::fetch_row).unwrap_or_default()
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        self.cursor_mut().map(RowCursor::fetch_all).unwrap_or_default()
    }

    pub fn is_row_available(&self) -> bool {
        match &self.outcome {
            Some(Outcome::Cursor(cursor)) => cursor.is_row_available(),
            _ => false,
        }
    }

    /// True once, right after the cursor ran out
    pub fn take_end_of_cursor(&mut self) -> bool {
        self.cursor_mut().is_some_and(RowCursor::take_end_of_cursor)
    }

    /// Affected rows; `None` when the statement opened a cursor or has not run
    pub fn row_count(&self) -> Option<usize> {
        match self.outcome {
            Some(Outcome::RowCount(count)) => Some(count),
            _ => None,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        match &self.outcome {
            Some(Outcome::Cursor(cursor)) => cursor.column_names().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Invalidate the statement and its cursor
    pub fn close(&mut self) {
        if let Some(cursor) = self.cursor_mut() {
            cursor.close();
        }
    }
}
