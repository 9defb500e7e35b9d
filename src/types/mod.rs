// Module for value types and driver conversions
pub mod value;

pub use value::{ColumnKind, Row, Value};
