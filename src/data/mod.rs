pub mod schema;

pub use schema::{validate_schema_bytes, ColumnSchema, DataType, TableSchema};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema has no columns")]
    Empty,

    #[error("Schema has too many columns: {0}")]
    TooManyColumns(usize),

    #[error("Schema bytes are truncated")]
    Truncated,

    #[error("Unknown column type code: {0}")]
    UnknownType(u8),

    #[error("Column name is not valid UTF-8")]
    InvalidName,

    #[error("Schema length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}
