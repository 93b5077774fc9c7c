//! Extract data model: column types, schemas and rows.
//!
//! Values cross the pipeline in two shapes. A [`RawRow`] holds the untyped
//! cells a source produced; a [`TypedRow`] holds cells already converted to
//! the extract type of each column in a [`Schema`].

pub mod coerce;
pub mod schema;
pub mod types;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::Arc;

pub use coerce::RowCoercer;
pub use schema::SchemaBuilder;
pub use types::map_type;

/// Runtime type tag reported by a source for one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceType {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    Bytes,
    Date,
    Timestamp,
    Time,
    Interval,
    /// Anything the driver reports that has no dedicated tag.
    Other(String),
}

/// Column type of the extract file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractType {
    Integer,
    Double,
    Boolean,
    Date,
    DateTime,
    Duration,
    CharString,
    UnicodeString,
}

impl ExtractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractType::Integer => "integer",
            ExtractType::Double => "double",
            ExtractType::Boolean => "boolean",
            ExtractType::Date => "date",
            ExtractType::DateTime => "datetime",
            ExtractType::Duration => "duration",
            ExtractType::CharString => "char_string",
            ExtractType::UnicodeString => "unicode_string",
        }
    }
}

impl fmt::Display for ExtractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and source type of one result column, as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub source_type: SourceType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            name: name.into(),
            source_type,
        }
    }
}

/// One column of an extract table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    name: String,
    source_type: SourceType,
    extract_type: ExtractType,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, source_type: SourceType, extract_type: ExtractType) -> Self {
        Self {
            name: name.into(),
            source_type,
            extract_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_type(&self) -> &SourceType {
        &self.source_type
    }

    pub fn extract_type(&self) -> ExtractType {
        self.extract_type
    }
}

/// Ordered column definitions of an extract table.
///
/// Columns are addressed by position only; names may repeat. A schema is
/// immutable once built and is shared between the consumer and the sink
/// through an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnDescriptor>,
}

/// Shared handle to an immutable schema.
pub type SchemaRef = Arc<Schema>;

impl Schema {
    pub(crate) fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDescriptor> {
        self.columns.get(index)
    }

    /// Extract types in column order.
    pub fn extract_types(&self) -> impl Iterator<Item = ExtractType> + '_ {
        self.columns.iter().map(ColumnDescriptor::extract_type)
    }
}

/// An untyped cell as produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Boolean(bool),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    /// Exact decimal kept in its textual form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Time(NaiveTime),
    Interval {
        months: i32,
        days: i32,
        nanos: i64,
    },
}

/// Untyped cells of one source record, in column order.
pub type RawRow = Vec<RawValue>;

/// A typed cell bound to an extract column type.
///
/// Date and time values are kept decomposed into their calendar fields.
/// `frac` counts units of 1/10000 of a second.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Date {
        year: i32,
        month: u32,
        day: u32,
    },
    DateTime {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        frac: u32,
    },
    Duration {
        days: i64,
        hour: u32,
        minute: u32,
        second: u32,
        frac: u32,
    },
    CharString(String),
    UnicodeString(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

/// A row of typed cells matching a schema.
///
/// A sink takes ownership of the row on insert, so a row is released as
/// soon as the insert call returns and cannot be reused.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    cells: Vec<Cell>,
}

impl TypedRow {
    pub(crate) fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }
}
