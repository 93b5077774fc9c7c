//! sqlextract: run one SQL query and write its result to an extract file.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sqlextract::config::{Config, interpolate};
use sqlextract::error::{
    AddressParseSnafu, ConfigSnafu, ConnectionSnafu, EnvInterpolationSnafu, MetricsSnafu,
    PipelineError,
};
use sqlextract::{ConnectionParams, ExtractJob, Query, metrics, run_pipeline};

/// Query-to-extract tool.
#[derive(Parser, Debug)]
#[command(name = "sqlextract")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the extract file to create.
    #[arg(long, alias = "tde")]
    extract: PathBuf,

    /// Connection descriptor, e.g. "provider=duckdb;database=sales.duckdb".
    #[arg(long)]
    cn: String,

    /// Path to a file holding the query text.
    #[arg(long)]
    sql: PathBuf,

    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration and connection descriptor, then exit.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("sqlextract starting");

    let config = build_config(&args)?;
    let job = build_job(&args)?;

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Extract: {}", job.extract.display());
        info!("Connection: {}", job.connection);
        info!("Provider: {}", job.connection.provider());
        info!("Query: {}", job.query);
        info!(
            "Table: {} (batch rows {}, compression {:?}, overwrite {})",
            config.sink.table_name,
            config.sink.batch_rows,
            config.sink.compression,
            config.sink.overwrite
        );
        info!("Configuration is valid");
        return Ok(());
    }

    let stats = run_pipeline(config, job).await?;

    if stats.cancelled {
        info!("Pipeline stopped by shutdown request");
    } else {
        info!("Pipeline completed successfully");
    }
    info!("  Rows read: {}", stats.rows_read);
    info!("  Rows written: {}", stats.rows_written);
    info!("  Cells stored as null: {}", stats.cells_nulled);
    info!("  Batches written: {}", stats.sink.batches);
    info!("  Bytes written: {}", stats.sink.bytes);
    info!("  Elapsed: {:.3}s", stats.elapsed.as_secs_f64());

    Ok(())
}

/// Load the YAML configuration, or defaults when none is given.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu),
        None => Ok(Config::default()),
    }
}

/// Interpolate and parse the connection descriptor.
fn build_job(args: &Args) -> Result<ExtractJob, PipelineError> {
    let descriptor = interpolate(&args.cn)
        .map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })
        .context(ConfigSnafu)?;
    let connection = ConnectionParams::parse(&descriptor).context(ConnectionSnafu)?;

    Ok(ExtractJob {
        extract: args.extract.clone(),
        connection,
        query: Query::File(args.sql.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_tde_alias() {
        let args = Args::try_parse_from([
            "sqlextract",
            "--tde",
            "out.parquet",
            "--cn",
            "provider=duckdb",
            "--sql",
            "q.sql",
        ])
        .unwrap();

        assert_eq!(args.extract, PathBuf::from("out.parquet"));
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_require_all_inputs() {
        let err = Args::try_parse_from(["sqlextract", "--extract", "out.parquet"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_build_job_rejects_bad_descriptor() {
        let args = Args::try_parse_from([
            "sqlextract",
            "--extract",
            "out.parquet",
            "--cn",
            "server=db01;uid=etl",
            "--sql",
            "q.sql",
        ])
        .unwrap();

        let err = build_job(&args).unwrap_err();
        assert!(matches!(err, PipelineError::Connection { .. }));
    }
}
