//! DuckDB query source.
//!
//! Results are streamed as Arrow record batches and unpacked row by row, so
//! memory use is bounded by one batch regardless of result size. Statements
//! that cannot be wrapped in a subquery are read in one piece.

use duckdb::Connection;
use duckdb::arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use duckdb::arrow::datatypes::{
    DataType, Date32Type, Date64Type, Decimal128Type, Decimal256Type, DurationMicrosecondType,
    DurationMillisecondType, DurationNanosecondType, DurationSecondType, Float16Type, Float32Type,
    Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, IntervalDayTimeType, IntervalMonthDayNanoType,
    IntervalUnit, IntervalYearMonthType, Time32MillisecondType, Time32SecondType,
    Time64MicrosecondType, Time64NanosecondType, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType, UInt8Type,
    SchemaRef, UInt16Type, UInt32Type, UInt64Type,
};
use duckdb::arrow::util::display::array_value_to_string;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{QuerySource, RowVisitor};
use crate::error::{ConnectSnafu, DriverSnafu, ExecuteSnafu, SourceError, TransactionSnafu};
use crate::extract::{ColumnMeta, RawRow, RawValue, SourceType};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Source backed by a DuckDB database file, or an in-memory database when
/// no path is given.
pub struct DuckDbSource {
    database: Option<PathBuf>,
    conn: Option<Connection>,
}

impl DuckDbSource {
    pub fn new(database: Option<PathBuf>) -> Self {
        Self {
            database,
            conn: None,
        }
    }

    /// Source over an in-memory database.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn database(&self) -> Option<&Path> {
        self.database.as_deref()
    }

    fn connection(&mut self) -> Result<&mut Connection, SourceError> {
        if self.conn.is_none() {
            let conn = match &self.database {
                Some(path) => Connection::open(path).context(ConnectSnafu {
                    target: path.display().to_string(),
                })?,
                None => Connection::open_in_memory().context(ConnectSnafu {
                    target: ":memory:",
                })?,
            };
            debug!("Opened DuckDB connection to {}", self.target());
            self.conn = Some(conn);
        }

        self.conn
            .as_mut()
            .context(DriverSnafu {
                message: "connection unavailable",
            })
    }

    fn target(&self) -> String {
        match &self.database {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }
}

impl QuerySource for DuckDbSource {
    fn query(&mut self, query: &str, visit: &mut RowVisitor<'_>) -> Result<usize, SourceError> {
        let conn: &Connection = self.connection()?;
        let schema = result_schema(conn, query);
        let mut stmt = conn.prepare(query).context(ExecuteSnafu)?;

        let batches: Box<dyn Iterator<Item = RecordBatch> + '_> = match schema {
            Some(schema) => Box::new(stmt.stream_arrow([], schema).context(ExecuteSnafu)?),
            None => {
                debug!("Statement has no result schema up front, reading it in one piece");
                Box::new(stmt.query_arrow([]).context(ExecuteSnafu)?)
            }
        };

        let mut metadata: Option<Vec<ColumnMeta>> = None;
        let mut visited = 0usize;

        for batch in batches {
            let columns = metadata.get_or_insert_with(|| describe_batch(&batch));

            for row in 0..batch.num_rows() {
                let values = read_row(&batch, row)?;
                visited += 1;
                if visit(columns, values).is_break() {
                    debug!("Row visitor stopped the query after {} rows", visited);
                    return Ok(visited);
                }
            }
        }

        Ok(visited)
    }

    fn execute_non_query(&mut self, statement: &str) -> Result<usize, SourceError> {
        let conn = self.connection()?;
        let tx = conn.transaction().context(TransactionSnafu)?;

        match tx.execute(statement, []) {
            Ok(affected) => {
                tx.commit().context(TransactionSnafu)?;
                Ok(affected)
            }
            Err(source) => {
                tx.rollback().context(TransactionSnafu)?;
                Err(source).context(TransactionSnafu)
            }
        }
    }
}

/// Result schema of `query`, taken from a zero-row run of it as a subquery.
///
/// `None` when the statement cannot be used as a subquery.
fn result_schema(conn: &Connection, query: &str) -> Option<SchemaRef> {
    let query = query.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM (\n{}\n) LIMIT 0", query))
        .ok()?;
    stmt.execute([]).ok()?;
    Some(stmt.schema())
}

fn describe_batch(batch: &RecordBatch) -> Vec<ColumnMeta> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|field| ColumnMeta::new(field.name().clone(), source_type(field.data_type())))
        .collect()
}

/// Tag an Arrow column type with the source type the extract mapping uses.
fn source_type(data_type: &DataType) -> SourceType {
    match data_type {
        DataType::Boolean => SourceType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => SourceType::Integer,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => SourceType::Float,
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => SourceType::Decimal,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => SourceType::Text,
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => SourceType::Bytes,
        DataType::Date32 | DataType::Date64 => SourceType::Date,
        DataType::Timestamp(_, _) => SourceType::Timestamp,
        DataType::Time32(_) | DataType::Time64(_) => SourceType::Time,
        DataType::Interval(_) | DataType::Duration(_) => SourceType::Interval,
        other => SourceType::Other(other.to_string()),
    }
}

fn read_row(batch: &RecordBatch, row: usize) -> Result<RawRow, SourceError> {
    batch
        .columns()
        .iter()
        .map(|column| read_value(column, row))
        .collect()
}

fn read_value(column: &ArrayRef, row: usize) -> Result<RawValue, SourceError> {
    if column.is_null(row) {
        return Ok(RawValue::Null);
    }

    let value = match column.data_type() {
        DataType::Boolean => RawValue::Boolean(column.as_boolean().value(row)),
        DataType::Int8 => RawValue::Integer(column.as_primitive::<Int8Type>().value(row).into()),
        DataType::Int16 => RawValue::Integer(column.as_primitive::<Int16Type>().value(row).into()),
        DataType::Int32 => RawValue::Integer(column.as_primitive::<Int32Type>().value(row).into()),
        DataType::Int64 => RawValue::Integer(column.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => RawValue::Integer(column.as_primitive::<UInt8Type>().value(row).into()),
        DataType::UInt16 => {
            RawValue::Integer(column.as_primitive::<UInt16Type>().value(row).into())
        }
        DataType::UInt32 => {
            RawValue::Integer(column.as_primitive::<UInt32Type>().value(row).into())
        }
        DataType::UInt64 => {
            RawValue::UnsignedInteger(column.as_primitive::<UInt64Type>().value(row))
        }
        DataType::Float16 => {
            RawValue::Float(column.as_primitive::<Float16Type>().value(row).to_f64())
        }
        DataType::Float32 => {
            RawValue::Float(column.as_primitive::<Float32Type>().value(row).into())
        }
        DataType::Float64 => RawValue::Float(column.as_primitive::<Float64Type>().value(row)),
        DataType::Decimal128(_, _) => {
            RawValue::Decimal(column.as_primitive::<Decimal128Type>().value_as_string(row))
        }
        DataType::Decimal256(_, _) => {
            RawValue::Decimal(column.as_primitive::<Decimal256Type>().value_as_string(row))
        }
        DataType::Utf8 => RawValue::Text(column.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => RawValue::Text(column.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => RawValue::Text(column.as_string_view().value(row).to_string()),
        DataType::Binary => RawValue::Bytes(column.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => RawValue::Bytes(column.as_binary::<i64>().value(row).to_vec()),
        DataType::BinaryView => RawValue::Bytes(column.as_binary_view().value(row).to_vec()),
        DataType::FixedSizeBinary(_) => {
            RawValue::Bytes(column.as_fixed_size_binary().value(row).to_vec())
        }
        DataType::Date32 => optional(
            column.as_primitive::<Date32Type>().value_as_date(row),
            RawValue::Date,
        ),
        DataType::Date64 => optional(
            column.as_primitive::<Date64Type>().value_as_date(row),
            RawValue::Date,
        ),
        DataType::Timestamp(unit, _) => {
            let timestamp = match unit {
                TimeUnit::Second => column
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(row),
                TimeUnit::Millisecond => column
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(row),
                TimeUnit::Microsecond => column
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(row),
                TimeUnit::Nanosecond => column
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(row),
            };
            optional(timestamp, RawValue::Timestamp)
        }
        DataType::Time32(TimeUnit::Second) => optional(
            column.as_primitive::<Time32SecondType>().value_as_time(row),
            RawValue::Time,
        ),
        DataType::Time32(TimeUnit::Millisecond) => optional(
            column
                .as_primitive::<Time32MillisecondType>()
                .value_as_time(row),
            RawValue::Time,
        ),
        DataType::Time64(TimeUnit::Microsecond) => optional(
            column
                .as_primitive::<Time64MicrosecondType>()
                .value_as_time(row),
            RawValue::Time,
        ),
        DataType::Time64(TimeUnit::Nanosecond) => optional(
            column
                .as_primitive::<Time64NanosecondType>()
                .value_as_time(row),
            RawValue::Time,
        ),
        DataType::Interval(IntervalUnit::MonthDayNano) => {
            let interval = column.as_primitive::<IntervalMonthDayNanoType>().value(row);
            RawValue::Interval {
                months: interval.months,
                days: interval.days,
                nanos: interval.nanoseconds,
            }
        }
        DataType::Interval(IntervalUnit::DayTime) => {
            let interval = column.as_primitive::<IntervalDayTimeType>().value(row);
            RawValue::Interval {
                months: 0,
                days: interval.days,
                nanos: i64::from(interval.milliseconds) * NANOS_PER_MILLI,
            }
        }
        DataType::Interval(IntervalUnit::YearMonth) => RawValue::Interval {
            months: column.as_primitive::<IntervalYearMonthType>().value(row),
            days: 0,
            nanos: 0,
        },
        DataType::Duration(unit) => {
            let (value, nanos_per_unit) = match unit {
                TimeUnit::Second => (
                    column.as_primitive::<DurationSecondType>().value(row),
                    1_000_000_000,
                ),
                TimeUnit::Millisecond => (
                    column.as_primitive::<DurationMillisecondType>().value(row),
                    NANOS_PER_MILLI,
                ),
                TimeUnit::Microsecond => (
                    column.as_primitive::<DurationMicrosecondType>().value(row),
                    1_000,
                ),
                TimeUnit::Nanosecond => (
                    column.as_primitive::<DurationNanosecondType>().value(row),
                    1,
                ),
            };
            // Out of range durations degrade to text so the cell is kept.
            match value.checked_mul(nanos_per_unit) {
                Some(nanos) => RawValue::Interval {
                    months: 0,
                    days: 0,
                    nanos,
                },
                None => display(column, row)?,
            }
        }
        _ => display(column, row)?,
    };

    Ok(value)
}

fn optional<T>(value: Option<T>, wrap: impl FnOnce(T) -> RawValue) -> RawValue {
    value.map(wrap).unwrap_or(RawValue::Null)
}

/// Render any other Arrow value through its display form.
fn display(column: &ArrayRef, row: usize) -> Result<RawValue, SourceError> {
    array_value_to_string(column, row)
        .map(RawValue::Text)
        .map_err(|e| {
            DriverSnafu {
                message: format!("failed to render {} value: {}", column.data_type(), e),
            }
            .build()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use duckdb::arrow::array::{BinaryViewArray, FixedSizeBinaryArray, Float32Array};
    use duckdb::arrow::compute::cast;
    use std::ops::ControlFlow;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn collect(source: &mut DuckDbSource, query: &str) -> (Vec<ColumnMeta>, Vec<RawRow>) {
        let mut metadata = Vec::new();
        let mut rows = Vec::new();
        source
            .query(query, &mut |meta, row| {
                if metadata.is_empty() {
                    metadata = meta.to_vec();
                }
                rows.push(row);
                ControlFlow::Continue(())
            })
            .unwrap();
        (metadata, rows)
    }

    #[test]
    fn test_query_metadata_and_values() {
        let mut source = DuckDbSource::in_memory();
        let (metadata, rows) = collect(
            &mut source,
            "SELECT 1::INTEGER AS id, 'Alice' AS name, NULL::VARCHAR AS note, \
             3.5::DOUBLE AS score, true AS active, DATE '2024-03-15' AS day, \
             TIME '10:30:00' AS at",
        );

        let names: Vec<_> = metadata.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "note", "score", "active", "day", "at"]);
        assert_eq!(metadata[0].source_type, SourceType::Integer);
        assert_eq!(metadata[1].source_type, SourceType::Text);
        assert_eq!(metadata[5].source_type, SourceType::Date);
        assert_eq!(metadata[6].source_type, SourceType::Time);

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row[0], RawValue::Integer(1));
        assert_eq!(row[1], RawValue::Text("Alice".to_string()));
        assert_eq!(row[2], RawValue::Null);
        assert_eq!(row[3], RawValue::Float(3.5));
        assert_eq!(row[4], RawValue::Boolean(true));
        assert_eq!(
            row[5],
            RawValue::Date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
        );
        assert_eq!(
            row[6],
            RawValue::Time(NaiveTime::from_hms_opt(10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decimal_is_reported_as_text() {
        let mut source = DuckDbSource::in_memory();
        let (metadata, rows) = collect(&mut source, "SELECT 12.50::DECIMAL(10, 2) AS price");

        assert_eq!(metadata[0].source_type, SourceType::Decimal);
        assert_eq!(rows[0][0], RawValue::Decimal("12.50".to_string()));
    }

    #[test]
    fn test_rows_arrive_in_order() {
        let mut source = DuckDbSource::in_memory();
        let (_, rows) = collect(&mut source, "SELECT range AS n FROM range(5000) ORDER BY n");

        assert_eq!(rows.len(), 5000);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row[0], RawValue::Integer(i as i64));
        }
    }

    #[test]
    fn test_visitor_can_stop_early() {
        let mut source = DuckDbSource::in_memory();
        let mut seen = 0;
        let visited = source
            .query("SELECT range FROM range(100)", &mut |_, _| {
                seen += 1;
                if seen == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        assert_eq!(visited, 3);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_large_result_stops_after_first_row() {
        let mut source = DuckDbSource::in_memory();
        let visited = source
            .query("SELECT range, range * 2 FROM range(10000000)", &mut |_, _| {
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_trailing_semicolon_and_comment() {
        let mut source = DuckDbSource::in_memory();
        let (_, rows) = collect(&mut source, "SELECT 1 AS id;  ");
        assert_eq!(rows, vec![vec![RawValue::Integer(1)]]);

        let (_, rows) = collect(&mut source, "SELECT 2 AS id -- second");
        assert_eq!(rows, vec![vec![RawValue::Integer(2)]]);
    }

    #[test]
    fn test_statement_outside_a_subquery_still_reads() {
        let mut source = DuckDbSource::in_memory();
        source
            .execute_non_query("CREATE TABLE t (id INTEGER)")
            .unwrap();
        let (metadata, rows) = collect(&mut source, "PRAGMA table_info('t')");
        assert!(!metadata.is_empty());
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_half_float_and_binary_views_are_read_natively() {
        let half: ArrayRef = cast(&Float32Array::from(vec![1.5]), &DataType::Float16).unwrap();
        assert_eq!(source_type(half.data_type()), SourceType::Float);
        assert_eq!(read_value(&half, 0).unwrap(), RawValue::Float(1.5));

        let view: ArrayRef = Arc::new(BinaryViewArray::from_iter_values([b"ab".as_slice()]));
        assert_eq!(source_type(view.data_type()), SourceType::Bytes);
        assert_eq!(read_value(&view, 0).unwrap(), RawValue::Bytes(b"ab".to_vec()));

        let fixed: ArrayRef = Arc::new(
            FixedSizeBinaryArray::try_from_iter(vec![vec![1u8, 2], vec![3, 4]].into_iter()).unwrap(),
        );
        assert_eq!(source_type(fixed.data_type()), SourceType::Bytes);
        assert_eq!(read_value(&fixed, 1).unwrap(), RawValue::Bytes(vec![3, 4]));
    }

    #[test]
    fn test_empty_result_reports_no_rows() {
        let mut source = DuckDbSource::in_memory();
        let (metadata, rows) = collect(&mut source, "SELECT 1 AS id WHERE false");
        assert!(rows.is_empty());
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_invalid_query_fails() {
        let mut source = DuckDbSource::in_memory();
        let err = source
            .query("SELECT * FROM missing_table", &mut |_, _| {
                ControlFlow::Continue(())
            })
            .unwrap_err();
        assert!(matches!(err, SourceError::Execute { .. }));
    }

    #[test]
    fn test_execute_non_query_commits() {
        let dir = TempDir::new().unwrap();
        let mut source = DuckDbSource::new(Some(dir.path().join("test.duckdb")));

        source
            .execute_non_query("CREATE TABLE people (id INTEGER, name VARCHAR)")
            .unwrap();
        let affected = source
            .execute_non_query("INSERT INTO people VALUES (1, 'Alice'), (2, 'Bob')")
            .unwrap();
        assert_eq!(affected, 2);

        let (_, rows) = collect(&mut source, "SELECT name FROM people ORDER BY id");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], RawValue::Text("Bob".to_string()));
    }

    #[test]
    fn test_execute_non_query_failure_rolls_back() {
        let mut source = DuckDbSource::in_memory();
        source
            .execute_non_query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        source.execute_non_query("INSERT INTO t VALUES (1)").unwrap();

        let err = source
            .execute_non_query("INSERT INTO t VALUES (2), (1)")
            .unwrap_err();
        assert!(matches!(err, SourceError::Transaction { .. }));

        let (_, rows) = collect(&mut source, "SELECT id FROM t");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_missing_directory_fails_to_connect() {
        let dir = TempDir::new().unwrap();
        let mut source = DuckDbSource::new(Some(dir.path().join("no/such/dir/db.duckdb")));
        let err = source
            .query("SELECT 1", &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, SourceError::Connect { .. }));
    }
}
