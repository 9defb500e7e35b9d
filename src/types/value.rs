use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use std::fmt;

/// A value in one of the session's canonical types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
}

/// One fetched row. An exhausted cursor yields an empty row.
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqliteValue;

        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            // Whole numbers bind as integers so they compare equal to INTEGER columns
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                ToSqlOutput::Owned(SqliteValue::Integer(*n as i64))
            }
            Value::Number(n) => ToSqlOutput::Owned(SqliteValue::Real(*n)),
            Value::Boolean(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
        })
    }
}

/// Canonical type tag of a result column, captured once when a cursor opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Character, binary and temporal columns
    Text,
    /// Integer, fixed-point and floating-point columns
    Numeric,
    /// Boolean and bit columns
    Boolean,
}

impl ColumnKind {
    /// Classify a declared SQLite column type
    pub fn from_declared_type(declared: &str) -> ColumnKind {
        let type_upper = declared.trim().to_uppercase();

        if type_upper.contains("BOOL") || type_upper == "BIT" || type_upper.starts_with("BIT(") {
            return ColumnKind::Boolean;
        }

        // Temporal types are served as strings even though SQLite gives them numeric affinity
        if type_upper.contains("DATE") || type_upper.contains("TIME") || type_upper.contains("INTERVAL") {
            return ColumnKind::Text;
        }

        if type_upper.contains("CHAR")
            || type_upper.contains("CLOB")
            || type_upper.contains("TEXT")
            || type_upper.contains("BLOB")
            || type_upper.contains("BINARY")
        {
            return ColumnKind::Text;
        }

        if type_upper.contains("INT")
            || type_upper.contains("REAL")
            || type_upper.contains("FLOA")
            || type_upper.contains("DOUB")
            || type_upper.contains("NUMERIC")
            || type_upper.contains("DECIMAL")
        {
            return ColumnKind::Numeric;
        }

        ColumnKind::Text
    }

    /// Classify an expression column from the storage class of a sample value
    pub fn from_value(value: Option<ValueRef<'_>>) -> ColumnKind {
        match value {
            Some(ValueRef::Integer(_)) | Some(ValueRef::Real(_)) => ColumnKind::Numeric,
            _ => ColumnKind::Text,
        }
    }

    /// Convert a driver value into this column's canonical type
    pub fn convert(self, value: ValueRef<'_>) -> Value {
        match (self, value) {
            (_, ValueRef::Null) => Value::Null,

            (ColumnKind::Text, ValueRef::Integer(i)) => Value::Text(i.to_string()),
            (ColumnKind::Text, ValueRef::Real(f)) => Value::Text(f.to_string()),
            (ColumnKind::Text, ValueRef::Text(s)) => Value::Text(String::from_utf8_lossy(s).into_owned()),

            (ColumnKind::Numeric, ValueRef::Integer(i)) => Value::Number(i as f64),
            (ColumnKind::Numeric, ValueRef::Real(f)) => Value::Number(f),
            (ColumnKind::Numeric, ValueRef::Text(s)) => {
                let text = String::from_utf8_lossy(s);
                match text.trim().parse::<f64>() {
                    Ok(n) => Value::Number(n),
                    Err(_) => Value::Text(text.into_owned()),
                }
            }

            (ColumnKind::Boolean, ValueRef::Integer(i)) => Value::Boolean(i != 0),
            (ColumnKind::Boolean, ValueRef::Real(f)) => Value::Boolean(f != 0.0),
            (ColumnKind::Boolean, ValueRef::Text(s)) => {
                let text = String::from_utf8_lossy(s);
                match parse_bool(&text) {
                    Some(b) => Value::Boolean(b),
                    None => Value::Text(text.into_owned()),
                }
            }

            (_, ValueRef::Blob(b)) => Value::Text(hex::encode(b)),
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_type_classification() {
        assert_eq!(ColumnKind::from_declared_type("INTEGER"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_declared_type("bigint"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_declared_type("DECIMAL(10,2)"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_declared_type("double precision"), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_declared_type("VARCHAR(32)"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_declared_type("BLOB"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_declared_type("TIMESTAMP"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_declared_type("DATE"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_declared_type("BOOLEAN"), ColumnKind::Boolean);
        assert_eq!(ColumnKind::from_declared_type("bit"), ColumnKind::Boolean);
        assert_eq!(ColumnKind::from_declared_type("JSON"), ColumnKind::Text);
    }

    #[test]
    fn test_convert_by_kind() {
        assert_eq!(ColumnKind::Numeric.convert(ValueRef::Integer(42)), Value::Number(42.0));
        assert_eq!(ColumnKind::Text.convert(ValueRef::Integer(42)), Value::Text("42".into()));
        assert_eq!(ColumnKind::Boolean.convert(ValueRef::Integer(0)), Value::Boolean(false));
        assert_eq!(ColumnKind::Boolean.convert(ValueRef::Text(b"true")), Value::Boolean(true));
        assert_eq!(ColumnKind::Numeric.convert(ValueRef::Text(b" 2.5 ")), Value::Number(2.5));
        assert_eq!(ColumnKind::Text.convert(ValueRef::Blob(&[0xde, 0xad])), Value::Text("dead".into()));
        assert_eq!(ColumnKind::Boolean.convert(ValueRef::Null), Value::Null);
    }

    #[test]
    fn test_unparsable_numeric_text_is_kept_as_text() {
        assert_eq!(
            ColumnKind::Numeric.convert(ValueRef::Text(b"n/a")),
            Value::Text("n/a".into())
        );
    }

    #[test]
    fn test_expression_columns_classified_by_value() {
        assert_eq!(ColumnKind::from_value(Some(ValueRef::Real(1.5))), ColumnKind::Numeric);
        assert_eq!(ColumnKind::from_value(Some(ValueRef::Text(b"x"))), ColumnKind::Text);
        assert_eq!(ColumnKind::from_value(None), ColumnKind::Text);
    }
}
