//! Parquet extract file.
//!
//! Buffers typed rows in Arrow column builders and writes them to a single
//! Parquet file in batches of `batch_rows`. Each field carries an
//! `extract.type` metadata entry naming its extract column type.

use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, RecordBatch,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef as ArrowSchemaRef, TimeUnit};
use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{ExtractSink, SinkSummary};
use crate::config::ParquetCompression;
use crate::emit;
use crate::error::{
    BatchBuildSnafu, ClosedSnafu, CreateFileSnafu, ExtractExistsSnafu, NoTableSnafu,
    RemoveExistingSnafu, RowShapeSnafu, SinkError, SyncSnafu, TableExistsSnafu, WriteSnafu,
    WriterCreateSnafu,
};
use crate::extract::{Cell, ExtractType, SchemaRef, TypedRow};
use crate::metrics::events::ExtractBatchFlushed;

/// Field metadata key holding the extract column type.
pub const EXTRACT_TYPE_KEY: &str = "extract.type";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;
const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;
const MICROS_PER_FRAC: i64 = 100;

/// Configuration for the Parquet extract.
#[derive(Debug, Clone)]
pub struct ParquetExtractConfig {
    /// Rows buffered before a batch is written to the file.
    pub batch_rows: usize,
    /// Compression codec.
    pub compression: ParquetCompression,
    /// Remove an existing file at the destination instead of failing.
    pub overwrite: bool,
}

impl Default for ParquetExtractConfig {
    fn default() -> Self {
        Self {
            batch_rows: 8192,
            compression: ParquetCompression::Snappy,
            overwrite: true,
        }
    }
}

impl ParquetExtractConfig {
    /// Set the number of rows per written batch.
    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    /// Set the compression codec.
    pub fn with_compression(mut self, compression: ParquetCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Set whether an existing destination file is replaced.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Builder for one extract column.
enum ColumnBuilder {
    Integer(Int64Builder),
    Double(Float64Builder),
    Boolean(BooleanBuilder),
    Date(Date32Builder),
    DateTime(TimestampMicrosecondBuilder),
    /// Microseconds, tagged `duration` in the field metadata.
    Duration(Int64Builder),
    Text(StringBuilder),
}

impl ColumnBuilder {
    fn new(extract_type: ExtractType, capacity: usize) -> Self {
        match extract_type {
            ExtractType::Integer => Self::Integer(Int64Builder::with_capacity(capacity)),
            ExtractType::Double => Self::Double(Float64Builder::with_capacity(capacity)),
            ExtractType::Boolean => Self::Boolean(BooleanBuilder::with_capacity(capacity)),
            ExtractType::Date => Self::Date(Date32Builder::with_capacity(capacity)),
            ExtractType::DateTime => {
                Self::DateTime(TimestampMicrosecondBuilder::with_capacity(capacity))
            }
            ExtractType::Duration => Self::Duration(Int64Builder::with_capacity(capacity)),
            ExtractType::CharString | ExtractType::UnicodeString => {
                Self::Text(StringBuilder::with_capacity(capacity, capacity * 16))
            }
        }
    }

    fn append(&mut self, value: Encoded) {
        match (self, value) {
            (Self::Integer(b), Encoded::I64(v)) => b.append_value(v),
            (Self::Double(b), Encoded::F64(v)) => b.append_value(v),
            (Self::Boolean(b), Encoded::Bool(v)) => b.append_value(v),
            (Self::Date(b), Encoded::Date32(v)) => b.append_value(v),
            (Self::DateTime(b), Encoded::I64(v)) => b.append_value(v),
            (Self::Duration(b), Encoded::I64(v)) => b.append_value(v),
            (Self::Text(b), Encoded::Str(v)) => b.append_value(v),
            (builder, _) => builder.append_null(),
        }
    }

    fn append_null(&mut self) {
        match self {
            Self::Integer(b) => b.append_null(),
            Self::Double(b) => b.append_null(),
            Self::Boolean(b) => b.append_null(),
            Self::Date(b) => b.append_null(),
            Self::DateTime(b) => b.append_null(),
            Self::Duration(b) => b.append_null(),
            Self::Text(b) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Integer(b) => Arc::new(b.finish()),
            Self::Double(b) => Arc::new(b.finish()),
            Self::Boolean(b) => Arc::new(b.finish()),
            Self::Date(b) => Arc::new(b.finish()),
            Self::DateTime(b) => Arc::new(b.finish()),
            Self::Duration(b) => Arc::new(b.finish()),
            Self::Text(b) => Arc::new(b.finish()),
        }
    }
}

/// A cell converted to the physical value its column builder stores.
enum Encoded {
    Null,
    I64(i64),
    F64(f64),
    Bool(bool),
    Date32(i32),
    Str(String),
}

/// Arrow data type that stores an extract column type.
pub fn arrow_type(extract_type: ExtractType) -> DataType {
    match extract_type {
        ExtractType::Integer => DataType::Int64,
        ExtractType::Double => DataType::Float64,
        ExtractType::Boolean => DataType::Boolean,
        ExtractType::Date => DataType::Date32,
        ExtractType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        // Parquet has no duration logical type.
        ExtractType::Duration => DataType::Int64,
        ExtractType::CharString | ExtractType::UnicodeString => DataType::Utf8,
    }
}

/// Convert an extract schema to the Arrow schema written to the file.
pub fn to_arrow_schema(schema: &SchemaRef) -> ArrowSchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|column| {
            let metadata = HashMap::from([(
                EXTRACT_TYPE_KEY.to_string(),
                column.extract_type().as_str().to_string(),
            )]);
            Field::new(column.name(), arrow_type(column.extract_type()), true)
                .with_metadata(metadata)
        })
        .collect();

    Arc::new(ArrowSchema::new(fields))
}

fn encode(column: usize, target: ExtractType, cell: Cell) -> Result<Encoded, SinkError> {
    let invalid = |message: String| SinkError::InvalidCell { column, message };

    let encoded = match (target, cell) {
        (_, Cell::Null) => Encoded::Null,
        (ExtractType::Integer, Cell::Integer(v)) => Encoded::I64(v),
        (ExtractType::Double, Cell::Double(v)) => Encoded::F64(v),
        (ExtractType::Boolean, Cell::Boolean(v)) => Encoded::Bool(v),
        (ExtractType::Date, Cell::Date { year, month, day }) => {
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| invalid(format!("{}-{}-{} is not a date", year, month, day)))?;
            Encoded::Date32(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
        }
        (
            ExtractType::DateTime,
            Cell::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                frac,
            },
        ) => {
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| invalid(format!("{}-{}-{} is not a date", year, month, day)))?;
            let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
                invalid(format!("{}:{}:{} is not a time", hour, minute, second))
            })?;
            let days = i64::from(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE);
            Encoded::I64(
                days * MICROS_PER_DAY
                    + i64::from(time.num_seconds_from_midnight()) * MICROS_PER_SECOND
                    + i64::from(frac) * MICROS_PER_FRAC,
            )
        }
        (
            ExtractType::Duration,
            Cell::Duration {
                days,
                hour,
                minute,
                second,
                frac,
            },
        ) => {
            let seconds = i64::from(hour) * 3600 + i64::from(minute) * 60 + i64::from(second);
            let micros = days
                .checked_mul(MICROS_PER_DAY)
                .and_then(|v| v.checked_add(seconds * MICROS_PER_SECOND))
                .and_then(|v| v.checked_add(i64::from(frac) * MICROS_PER_FRAC))
                .ok_or_else(|| invalid(format!("duration of {} days overflows", days)))?;
            Encoded::I64(micros)
        }
        (ExtractType::CharString, Cell::CharString(s))
        | (ExtractType::UnicodeString, Cell::UnicodeString(s)) => Encoded::Str(s),
        (target, cell) => {
            return Err(invalid(format!("{:?} does not fit a {} column", cell, target)));
        }
    };

    Ok(encoded)
}

/// The registered table and its open writer.
struct OpenTable {
    name: String,
    schema: SchemaRef,
    arrow_schema: ArrowSchemaRef,
    writer: ArrowWriter<File>,
    builders: Vec<ColumnBuilder>,
    buffered: usize,
}

/// Extract sink writing one table to one Parquet file.
pub struct ParquetExtract {
    path: PathBuf,
    config: ParquetExtractConfig,
    /// Destination file until a table takes it over.
    file: Option<File>,
    table: Option<OpenTable>,
    table_name: Option<String>,
    rows: usize,
    batches: usize,
    finalized: bool,
    summary: Option<SinkSummary>,
}

impl ParquetExtract {
    /// Create the extract file at `path`.
    ///
    /// Fails if the file exists and `overwrite` is off. With `overwrite` on
    /// the existing file is removed first, so every run starts fresh.
    pub fn create(path: impl AsRef<Path>, config: ParquetExtractConfig) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            ensure!(config.overwrite, ExtractExistsSnafu { path: path.clone() });
            info!("Removing existing extract {}", path.display());
            fs::remove_file(&path).context(RemoveExistingSnafu { path: path.clone() })?;
        }

        let file = File::create_new(&path).context(CreateFileSnafu { path: path.clone() })?;
        info!(
            "Created extract {} (batch_rows={}, compression={:?})",
            path.display(),
            config.batch_rows,
            config.compression
        );

        Ok(Self {
            path,
            config,
            file: Some(file),
            table: None,
            table_name: None,
            rows: 0,
            batches: 0,
            finalized: false,
            summary: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows accepted so far, including rows not yet flushed.
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn writer_properties(config: &ParquetExtractConfig) -> WriterProperties {
        let compression = match config.compression {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
        };

        WriterProperties::builder()
            .set_compression(compression)
            .build()
    }

    /// Write buffered rows to the file as one record batch.
    fn flush(&mut self) -> Result<(), SinkError> {
        let Some(table) = self.table.as_mut() else {
            return Ok(());
        };
        if table.buffered == 0 {
            return Ok(());
        }

        let start = Instant::now();
        let columns: Vec<ArrayRef> = table.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let batch =
            RecordBatch::try_new(Arc::clone(&table.arrow_schema), columns).context(BatchBuildSnafu)?;
        table.writer.write(&batch).context(WriteSnafu)?;

        let rows = table.buffered;
        table.buffered = 0;
        self.batches += 1;

        debug!("[extract] Flushed batch of {} rows to {}", rows, table.name);
        emit!(ExtractBatchFlushed {
            rows: rows as u64,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Write the footer and sync the file.
    ///
    /// A failed flush or sync leaves the extract retryable. A failed footer
    /// write consumes the writer, so later attempts report `Closed`.
    fn finalize(&mut self) -> Result<SinkSummary, SinkError> {
        if !self.finalized {
            self.flush()?;
            match (self.table.take(), self.file.take()) {
                (Some(table), _) => {
                    table.writer.close().context(WriteSnafu)?;
                }
                (None, Some(file)) => {
                    // No table was registered: leave a readable zero-column file.
                    let props = Self::writer_properties(&self.config);
                    ArrowWriter::try_new(file, Arc::new(ArrowSchema::empty()), Some(props))
                        .context(WriterCreateSnafu)?
                        .close()
                        .context(WriteSnafu)?;
                }
                (None, None) => return ClosedSnafu.fail(),
            }
            self.finalized = true;
        }

        File::open(&self.path)
            .and_then(|f| f.sync_all())
            .context(SyncSnafu {
                path: self.path.clone(),
            })?;

        let bytes = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let summary = SinkSummary {
            path: Some(self.path.clone()),
            table: self.table_name.clone(),
            rows: self.rows,
            batches: self.batches,
            bytes,
        };

        info!(
            "Closed extract {}: {} rows in {} batches, {} bytes",
            self.path.display(),
            summary.rows,
            summary.batches,
            summary.bytes
        );
        Ok(summary)
    }
}

impl ExtractSink for ParquetExtract {
    fn add_table(&mut self, name: &str, schema: SchemaRef) -> Result<(), SinkError> {
        ensure!(!self.finalized, ClosedSnafu);
        if let Some(existing) = &self.table {
            return TableExistsSnafu {
                name,
                existing: existing.name.clone(),
            }
            .fail();
        }
        let file = self.file.take().context(ClosedSnafu)?;

        let arrow_schema = to_arrow_schema(&schema);
        let props = Self::writer_properties(&self.config);
        let writer = ArrowWriter::try_new(file, Arc::clone(&arrow_schema), Some(props))
            .context(WriterCreateSnafu)?;

        let capacity = self.config.batch_rows.min(8192);
        let builders = schema
            .extract_types()
            .map(|t| ColumnBuilder::new(t, capacity))
            .collect();

        info!(
            "Added table '{}' with {} columns to {}",
            name,
            schema.len(),
            self.path.display()
        );

        self.table_name = Some(name.to_string());
        self.table = Some(OpenTable {
            name: name.to_string(),
            schema,
            arrow_schema,
            writer,
            builders,
            buffered: 0,
        });
        Ok(())
    }

    fn insert(&mut self, row: TypedRow) -> Result<(), SinkError> {
        ensure!(!self.finalized, ClosedSnafu);
        let table = self.table.as_mut().context(NoTableSnafu)?;
        ensure!(
            row.len() == table.schema.len(),
            RowShapeSnafu {
                expected: table.schema.len(),
                actual: row.len(),
            }
        );

        // Encode the whole row before touching the builders so a bad cell
        // leaves the buffered columns aligned.
        let encoded = row
            .into_cells()
            .into_iter()
            .zip(table.schema.extract_types())
            .enumerate()
            .map(|(column, (cell, target))| encode(column, target, cell))
            .collect::<Result<Vec<_>, _>>()?;

        for (builder, value) in table.builders.iter_mut().zip(encoded) {
            match value {
                Encoded::Null => builder.append_null(),
                value => builder.append(value),
            }
        }
        table.buffered += 1;
        self.rows += 1;

        if table.buffered >= self.config.batch_rows {
            self.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary, SinkError> {
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }

        let summary = self.finalize()?;
        self.summary = Some(summary.clone());
        Ok(summary)
    }
}

impl Drop for ParquetExtract {
    fn drop(&mut self) {
        if self.summary.is_none() {
            warn!(
                "Extract {} dropped without close, finalizing",
                self.path.display()
            );
            if let Err(e) = self.finalize() {
                warn!(error = %e, "Failed to finalize extract on drop");
            }
        }
    }
}
