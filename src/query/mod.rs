// Module for statement execution and cursors
pub mod cursor;
pub mod statement;

pub use cursor::{CursorPosition, RowCursor};
pub use statement::{ExecMode, Execution, StatementExecution};
