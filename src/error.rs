//! Error types for sqlextract using snafu.
//!
//! Each pipeline stage owns an error enum with context selectors. The
//! top-level [`PipelineError`] names the failing stage so the binary can
//! report where a run broke.

use snafu::prelude::*;
use std::path::PathBuf;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Channel capacity must be positive.
    #[snafu(display("pipeline.channel_capacity must be greater than zero"))]
    ZeroChannelCapacity,

    /// Batch size must be positive.
    #[snafu(display("sink.batch_rows must be greater than zero"))]
    ZeroBatchRows,

    /// Table name is empty.
    #[snafu(display("sink.table_name cannot be empty"))]
    EmptyTableName,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

// ============ Connection Errors ============

/// Errors raised while parsing a connection descriptor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectionError {
    /// A `;`-separated segment has no `=`.
    #[snafu(display("Invalid connection string segment '{segment}': expected key=value"))]
    MalformedSegment { segment: String },

    /// Only one half of a user/password pair was given.
    #[snafu(display(
        "Invalid connection string value: user and password must both be specified for non-trusted connections"
    ))]
    IncompleteCredentials,

    /// Port is not a number.
    #[snafu(display("Invalid port '{value}'"))]
    InvalidPort {
        value: String,
        source: std::num::ParseIntError,
    },
}

// ============ Source Errors ============

/// Fatal errors on the read side of the pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The query file does not exist.
    #[snafu(display("Query file \"{}\" was not found", path.display()))]
    QueryFileNotFound { path: PathBuf },

    /// The query file exists but could not be read as UTF-8 text.
    #[snafu(display("Failed to read query file \"{}\"", path.display()))]
    ReadQueryFile {
        source: std::io::Error,
        path: PathBuf,
    },

    /// The connection descriptor names a provider with no driver.
    #[snafu(display("Unsupported provider '{provider}'"))]
    UnsupportedProvider { provider: String },

    /// Opening the database failed.
    #[snafu(display("Failed to connect to {target}"))]
    Connect {
        source: duckdb::Error,
        target: String,
    },

    /// Preparing or executing the query failed.
    #[snafu(display("Query execution failed"))]
    Execute { source: duckdb::Error },

    /// Starting, committing or running a statement inside a transaction failed.
    #[snafu(display("Transactional statement failed"))]
    Transaction { source: duckdb::Error },

    /// A failure reported by a driver other than the built-in ones.
    #[snafu(display("Source driver failed: {message}"))]
    Driver { message: String },
}

// ============ Schema Errors ============

/// Fatal errors while building or registering the extract schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Metadata contained no columns.
    #[snafu(display("Column metadata must contain at least one column"))]
    EmptyMetadata,

    /// The sink refused the table definition.
    #[snafu(display("Sink rejected table '{table}'"))]
    Register { source: SinkError, table: String },
}

// ============ Sink Errors ============

/// Fatal errors on the write side of the pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// The destination exists and overwriting is disabled.
    #[snafu(display("Extract file {} already exists", path.display()))]
    ExtractExists { path: PathBuf },

    /// Removing a stale extract before recreating it failed.
    #[snafu(display("Failed to remove existing extract {}", path.display()))]
    RemoveExisting {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Creating the destination file failed.
    #[snafu(display("Failed to create extract file {}", path.display()))]
    CreateFile {
        source: std::io::Error,
        path: PathBuf,
    },

    /// A table was already registered on this extract.
    #[snafu(display("Table '{name}' cannot be added: extract already has table '{existing}'"))]
    TableExists { name: String, existing: String },

    /// A row arrived before any table was registered.
    #[snafu(display("No table has been added to the extract"))]
    NoTable,

    /// A row does not match the registered table width.
    #[snafu(display("Row has {actual} cells, table has {expected} columns"))]
    RowShape { expected: usize, actual: usize },

    /// A cell value does not fit its column.
    #[snafu(display("Invalid value for column {column}: {message}"))]
    InvalidCell { column: usize, message: String },

    /// The extract was already closed.
    #[snafu(display("Extract is closed"))]
    Closed,

    /// Failed to create the Parquet writer.
    #[snafu(display("Failed to create Parquet writer"))]
    WriterCreate {
        source: parquet::errors::ParquetError,
    },

    /// Parquet write error.
    #[snafu(display("Parquet write error"))]
    Write {
        source: parquet::errors::ParquetError,
    },

    /// Assembling a record batch from buffered rows failed.
    #[snafu(display("Failed to assemble record batch"))]
    BatchBuild { source: arrow::error::ArrowError },

    /// Flushing the file to durable storage failed.
    #[snafu(display("Failed to sync extract file {}", path.display()))]
    Sync {
        source: std::io::Error,
        path: PathBuf,
    },

    /// A failure reported by a storage backend other than the built-in one.
    #[snafu(display("Sink backend failed: {message}"))]
    Backend { message: String },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Connection descriptor error.
    #[snafu(display("Invalid connection descriptor"))]
    Connection { source: ConnectionError },

    /// Reading from the source failed.
    #[snafu(display("Source read failed"))]
    SourceRead { source: SourceError },

    /// Building or registering the schema failed.
    #[snafu(display("Schema registration failed"))]
    SchemaRegistration { source: SchemaError },

    /// Opening the extract file failed.
    #[snafu(display("Sink open failed"))]
    SinkOpen { source: SinkError },

    /// Inserting into the extract failed.
    #[snafu(display("Sink write failed"))]
    SinkWrite { source: SinkError },

    /// Finalizing the extract failed.
    #[snafu(display("Sink close failed"))]
    SinkClose { source: SinkError },

    /// The consumer saw a message out of protocol order.
    #[snafu(display("Protocol error: {message}"))]
    Protocol { message: String },

    /// A worker task panicked or was aborted.
    #[snafu(display("{worker} task join error"))]
    TaskJoin {
        source: tokio::task::JoinError,
        worker: &'static str,
    },

    /// A worker task panicked before handing the sink back.
    #[snafu(display("Consumer task lost the sink"))]
    SinkLost,

    /// `run` was called on a pipeline that already ran.
    #[snafu(display("Pipeline has already run"))]
    AlreadyRun,

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// Short name of the stage that failed, used in logs and metrics labels.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Config { .. } | PipelineError::Connection { .. } => "config",
            PipelineError::SourceRead { .. } => "source",
            PipelineError::SchemaRegistration { .. } => "schema",
            PipelineError::SinkOpen { .. } => "sink_open",
            PipelineError::SinkWrite { .. } => "sink_write",
            PipelineError::SinkClose { .. } => "sink_close",
            PipelineError::Protocol { .. } => "protocol",
            PipelineError::TaskJoin { .. } | PipelineError::SinkLost => "task",
            PipelineError::AlreadyRun => "pipeline",
            PipelineError::AddressParse { .. } | PipelineError::Metrics { .. } => "metrics",
        }
    }
}
