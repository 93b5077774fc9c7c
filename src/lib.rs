//! sqlextract: stream the result of a SQL query into a columnar extract file.
//!
//! A producer runs the query and a consumer writes rows to the extract,
//! connected by a bounded channel. Cells that do not fit their column type
//! are stored as null instead of failing the run.
//!
//! # Example
//!
//! ```ignore
//! use sqlextract::{Config, ExtractJob, Query, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let job = ExtractJob {
//!         extract: "orders.parquet".into(),
//!         connection: "provider=duckdb;database=sales.duckdb".parse().unwrap(),
//!         query: Query::File("orders.sql".into()),
//!     };
//!     let stats = run_pipeline(Config::default(), job).await?;
//!     println!("Wrote {} rows", stats.rows_written);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;

pub use config::Config;
pub use pipeline::{ExtractJob, Pipeline, PipelineSettings, PipelineState, PipelineStats, run_pipeline};
pub use source::{ConnectionParams, Query};
