//! Configuration loading and validation.
//!
//! The three run inputs (extract path, connection descriptor, query file)
//! come from the command line. Tuning knobs live in an optional YAML file;
//! every section may be omitted and takes its defaults.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;

use crate::error::{
    ConfigError, EmptyTableNameSnafu, EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu,
    ZeroBatchRowsSnafu, ZeroChannelCapacitySnafu,
};
use crate::extract::schema::DEFAULT_TABLE_NAME;
use crate::sink::ParquetExtractConfig;

pub use vars::interpolate;

/// Tuning configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Producer/consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Messages buffered between producer and consumer (default: 256).
    /// A full channel suspends the producer until the consumer catches up.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    256
}

/// Extract file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Name of the table inside the extract (default: "Extract").
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Rows buffered before a batch is written (default: 8192).
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// Parquet compression codec.
    #[serde(default)]
    pub compression: ParquetCompression,

    /// Replace an existing extract file (default: true).
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            batch_rows: default_batch_rows(),
            compression: ParquetCompression::default(),
            overwrite: default_overwrite(),
        }
    }
}

impl SinkConfig {
    /// Writer settings for the Parquet extract.
    pub fn extract_config(&self) -> ParquetExtractConfig {
        ParquetExtractConfig::default()
            .with_batch_rows(self.batch_rows)
            .with_compression(self.compression)
            .with_overwrite(self.overwrite)
    }
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_batch_rows() -> usize {
    8192
}

fn default_overwrite() -> bool {
    true
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is started (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating environment variables.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = interpolate(content)
            .map_err(|errors| EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build())?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.pipeline.channel_capacity > 0, ZeroChannelCapacitySnafu);
        ensure!(self.sink.batch_rows > 0, ZeroBatchRowsSnafu);
        ensure!(!self.sink.table_name.trim().is_empty(), EmptyTableNameSnafu);
        Ok(())
    }
}
