//! Table schema and its serialized form
//!
//! Snapshot files embed the schema of the table right after the header
//! metadata. The encoding is self-delimiting so a reader can find the first
//! chunk without any outside information:
//!
//! ```text
//! [u32 length of everything after this field]
//! [u16 column count]
//! [u8 type code] * column count
//! ([u32 name length][utf-8 name]) * column count
//! ```
//!
//! All integers are big-endian.

use serde::{Deserialize, Serialize};

use super::SchemaError;

/// Column data type for schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Bool,
    Int64,
    Float64,
    String,
    Timestamp,
    Varbinary,
}

impl DataType {
    /// Wire code stored in the serialized schema
    pub fn type_code(&self) -> u8 {
        match self {
            DataType::Null => 1,
            DataType::Bool => 2,
            DataType::Int64 => 6,
            DataType::Float64 => 8,
            DataType::String => 9,
            DataType::Timestamp => 11,
            DataType::Varbinary => 25,
        }
    }

    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DataType::Null),
            2 => Some(DataType::Bool),
            6 => Some(DataType::Int64),
            8 => Some(DataType::Float64),
            9 => Some(DataType::String),
            11 => Some(DataType::Timestamp),
            25 => Some(DataType::Varbinary),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Null => write!(f, "NULL"),
            DataType::Bool => write!(f, "BOOL"),
            DataType::Int64 => write!(f, "INT64"),
            DataType::Float64 => write!(f, "FLOAT64"),
            DataType::String => write!(f, "STRING"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Varbinary => write!(f, "VARBINARY"),
        }
    }
}

/// A single column of a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
}

/// Ordered column list of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            data_type,
        });
        self
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Serialize to the self-delimiting schema encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::Empty);
        }
        let column_count =
            u16::try_from(self.columns.len()).map_err(|_| SchemaError::TooManyColumns(self.columns.len()))?;

        let names_len: usize = self.columns.iter().map(|c| 4 + c.name.len()).sum();
        let mut out = Vec::with_capacity(4 + 2 + self.columns.len() + names_len);
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&column_count.to_be_bytes());
        for column in &self.columns {
            out.push(column.data_type.type_code());
        }
        for column in &self.columns {
            out.extend_from_slice(&(column.name.len() as u32).to_be_bytes());
            out.extend_from_slice(column.name.as_bytes());
        }

        let body_len = (out.len() - 4) as u32;
        out[0..4].copy_from_slice(&body_len.to_be_bytes());
        Ok(out)
    }

    /// Parse a schema from the front of `bytes`, returning it with the number of bytes consumed
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), SchemaError> {
        let total = encoded_len(bytes)?;
        let body = &bytes[4..total];
        let mut pos = 0;

        let column_count = u16::from_be_bytes(take::<2>(body, &mut pos)?) as usize;
        if column_count == 0 {
            return Err(SchemaError::Empty);
        }

        let mut types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let [code] = take::<1>(body, &mut pos)?;
            types.push(DataType::from_type_code(code).ok_or(SchemaError::UnknownType(code))?);
        }

        let mut columns = Vec::with_capacity(column_count);
        for data_type in types {
            let name_len = u32::from_be_bytes(take::<4>(body, &mut pos)?) as usize;
            let name_bytes = body
                .get(pos..pos + name_len)
                .ok_or(SchemaError::Truncated)?;
            pos += name_len;
            let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| SchemaError::InvalidName)?;
            columns.push(ColumnSchema { name, data_type });
        }

        if pos != body.len() {
            return Err(SchemaError::LengthMismatch {
                declared: body.len(),
                actual: pos,
            });
        }

        Ok((Self { columns }, total))
    }
}

/// Total encoded length (including the length field) of the schema at the front of `bytes`
pub fn encoded_len(bytes: &[u8]) -> Result<usize, SchemaError> {
    let prefix: [u8; 4] = bytes
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(SchemaError::Truncated)?;
    let total = 4 + u32::from_be_bytes(prefix) as usize;
    if bytes.len() < total {
        return Err(SchemaError::Truncated);
    }
    Ok(total)
}

/// Check that `bytes` is exactly one serialized schema
pub fn validate_schema_bytes(bytes: &[u8]) -> Result<(), SchemaError> {
    let (_, consumed) = TableSchema::from_bytes(bytes)?;
    if consumed != bytes.len() {
        return Err(SchemaError::LengthMismatch {
            declared: consumed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn take<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N], SchemaError> {
    let out: [u8; N] = bytes
        .get(*pos..*pos + N)
        .and_then(|b| b.try_into().ok())
        .ok_or(SchemaError::Truncated)?;
    *pos += N;
    Ok(out)
}
