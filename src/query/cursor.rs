use rusqlite::types::{Value as SqliteValue, ValueRef};

use crate::types::{ColumnKind, Row};

/// Where a cursor stands in its result set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    BeforeFirst,
    /// Index of the next row to serve
    Positioned(usize),
    Exhausted,
}

/// Cursor over a buffered result set.
///
/// Driver rows are captured when the cursor opens and converted to canonical values as
/// they are fetched, using the column kinds captured at open. The end of the cursor is
/// reported exactly once through [`RowCursor::take_end_of_cursor`].
#[derive(Debug)]
pub struct RowCursor {
    column_names: Vec<String>,
    column_kinds: Vec<ColumnKind>,
    rows: Vec<Vec<SqliteValue>>,
    position: CursorPosition,
    end_pending: bool,
}

impl RowCursor {
    /// Open a cursor. Declared column types decide the column kinds; undeclared columns
    /// (expressions) are classified from the first row.
    pub fn open(
        column_names: Vec<String>,
        declared_types: Vec<Option<String>>,
        rows: Vec<Vec<SqliteValue>>,
    ) -> Self {
        let column_kinds = declared_types
            .iter()
            .enumerate()
            .map(|(i, declared)| match declared {
                Some(declared) => ColumnKind::from_declared_type(declared),
                None => ColumnKind::from_value(
                    rows.first().and_then(|row| row.get(i)).map(ValueRef::from),
                ),
            })
            .collect();

        let mut cursor = RowCursor {
            column_names,
            column_kinds,
            rows,
            position: CursorPosition::BeforeFirst,
            end_pending: false,
        };
        cursor.position_first();
        cursor
    }

    fn position_first(&mut self) {
        if self.rows.is_empty() {
            self.mark_exhausted();
        } else {
            self.position = CursorPosition::Positioned(0);
        }
    }

    fn mark_exhausted(&mut self) {
        if self.position != CursorPosition::Exhausted {
            self.position = CursorPosition::Exhausted;
            self.end_pending = true;
        }
    }

    /// Serve the current row and advance. An exhausted cursor yields an empty row.
    pub fn fetch_row(&mut self) -> Row {
        let index = match self.position {
            CursorPosition::Positioned(index) => index,
            CursorPosition::BeforeFirst | CursorPosition::Exhausted => return Row::new(),
        };

        let row = self.convert_row(index);
        if index + 1 >= self.rows.len() {
            self.mark_exhausted();
        } else {
            self.position = CursorPosition::Positioned(index + 1);
        }
        row
    }

    /// Drain every row, starting over from the first one.
    ///
    /// Rows already served by [`RowCursor::fetch_row`] are served again; mixing the two on
    /// one cursor is not supported. An exhausted cursor yields nothing.
    pub fn fetch_all(&mut self) -> Vec<Row> {
        if self.position == CursorPosition::Exhausted {
            return Vec::new();
        }

        self.position_first();
        let mut rows = Vec::with_capacity(self.rows.len());
        while self.is_row_available() {
            rows.push(self.fetch_row());
        }
        rows
    }

    fn convert_row(&self, index: usize) -> Row {
        self.rows[index]
            .iter()
            .zip(&self.column_kinds)
            .map(|(value, kind)| kind.convert(ValueRef::from(value)))
            .collect()
    }

    pub fn is_row_available(&self) -> bool {
        matches!(self.position, CursorPosition::Positioned(_))
    }

    /// Report the end of the cursor once; later calls return false
    pub fn take_end_of_cursor(&mut self) -> bool {
        std::mem::take(&mut self.end_pending)
    }

    /// Invalidate the cursor without reporting its end
    pub fn close(&mut self) {
        self.rows.clear();
        self.position = CursorPosition::Exhausted;
        self.end_pending = false;
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_kinds(&self) -> &[ColumnKind] {
        &self.column_kinds
    }
}
