//! Extract sinks.
//!
//! A sink owns the destination file for one pipeline run. It accepts one
//! table definition, then rows one at a time, and is finalized by
//! [`ExtractSink::close`].

pub mod parquet;

use std::path::PathBuf;

use crate::error::SinkError;
use crate::extract::{SchemaRef, TypedRow};

pub use parquet::{ParquetExtract, ParquetExtractConfig};

/// What a sink wrote, reported by [`ExtractSink::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    /// Destination file, if the sink writes to one.
    pub path: Option<PathBuf>,
    /// Table registered on the extract, if any.
    pub table: Option<String>,
    /// Rows accepted by the sink.
    pub rows: usize,
    /// Batches flushed to the file.
    pub batches: usize,
    /// Size of the finished file in bytes.
    pub bytes: u64,
}

/// Destination of a pipeline run.
///
/// Implementations are driven by a single worker and never shared, so
/// they need `Send` but not `Sync`.
pub trait ExtractSink: Send {
    /// Register the table all following rows belong to. Called at most once.
    fn add_table(&mut self, name: &str, schema: SchemaRef) -> Result<(), SinkError>;

    /// Insert one row. The sink may buffer rows and write them in batches.
    fn insert(&mut self, row: TypedRow) -> Result<(), SinkError>;

    /// Flush buffered rows and finalize the destination.
    ///
    /// Closing an already closed sink is a no-op that returns the summary
    /// of the first close.
    fn close(&mut self) -> Result<SinkSummary, SinkError>;
}

impl<S: ExtractSink + ?Sized> ExtractSink for Box<S> {
    fn add_table(&mut self, name: &str, schema: SchemaRef) -> Result<(), SinkError> {
        (**self).add_table(name, schema)
    }

    fn insert(&mut self, row: TypedRow) -> Result<(), SinkError> {
        (**self).insert(row)
    }

    fn close(&mut self) -> Result<SinkSummary, SinkError> {
        (**self).close()
    }
}
