//! Extract pipeline.
//!
//! Moves the result of one query into one extract file.
//!
//! # Architecture
//!
//! A producer and a consumer run on Tokio's blocking pool, joined by one
//! bounded channel:
//! - **Producer**: runs the query and sends the column metadata once,
//!   then one message per row in source order
//! - **Consumer**: registers the schema, coerces each row and inserts it
//!
//! A full channel suspends the producer until the consumer catches up.
//! After both workers are joined the sink is closed exactly once, whether
//! the run succeeded or not.

mod signal;
mod tasks;

use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::Config;
use crate::emit;
use crate::error::{
    AlreadyRunSnafu, PipelineError, SinkCloseSnafu, SinkOpenSnafu, SourceReadSnafu, TaskJoinSnafu,
};
use crate::extract::SchemaBuilder;
use crate::metrics::events::{ExtractBytesWritten, PipelineCompleted, PipelineFailed, RunStatus};
use crate::sink::{ExtractSink, ParquetExtract, SinkSummary};
use crate::source::{ConnectionParams, Query, QuerySource, open_source};

pub use signal::{cancel_on_signal, shutdown_signal};
pub use tasks::PipelineMessage;

/// Lifecycle of a pipeline run.
///
/// `Idle → Running → Draining → Closed`, with `Failed` reachable from the
/// first three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    /// The producer finished; buffered rows are still being consumed.
    Draining = 2,
    Closed = 3,
    Failed = 4,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            3 => PipelineState::Closed,
            _ => PipelineState::Failed,
        }
    }
}

/// Shared view of a pipeline's state, readable while it runs.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl Default for StateHandle {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(PipelineState::Idle as u8)))
    }
}

impl StateHandle {
    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PipelineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Running → Draining. A no-op from any other state.
    fn begin_draining(&self) {
        let _ = self.0.compare_exchange(
            PipelineState::Running as u8,
            PipelineState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub table_name: String,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            table_name: config.sink.table_name.clone(),
            channel_capacity: config.pipeline.channel_capacity,
        }
    }
}

/// Statistics about a finished run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Rows pulled from the source and handed to the consumer.
    pub rows_read: usize,
    /// Rows inserted into the sink.
    pub rows_written: usize,
    /// Non-null cells stored as null because they could not be converted.
    pub cells_nulled: u64,
    pub elapsed: Duration,
    /// The run stopped early because shutdown was requested.
    pub cancelled: bool,
    /// What the sink reported when it was closed.
    pub sink: SinkSummary,
}

/// One query-to-extract run.
pub struct Pipeline<S, K> {
    source: Option<S>,
    sink: Option<K>,
    query: Query,
    settings: PipelineSettings,
    state: StateHandle,
    shutdown: CancellationToken,
    span: Span,
}

impl<S, K> Pipeline<S, K>
where
    S: QuerySource + 'static,
    K: ExtractSink + 'static,
{
    pub fn new(source: S, sink: K, query: Query, settings: PipelineSettings) -> Self {
        let span = info_span!("pipeline", table = %settings.table_name);
        Self {
            source: Some(source),
            sink: Some(sink),
            query,
            settings,
            state: StateHandle::default(),
            shutdown: CancellationToken::new(),
            span,
        }
    }

    /// Replace the span all run events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Token that stops the run when cancelled.
    ///
    /// The producer stops pulling rows, the consumer drains what is already
    /// buffered and the sink is closed; the run then succeeds with
    /// [`PipelineStats::cancelled`] set.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Handle for observing the state from another task during [`run`](Self::run).
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    /// Run the pipeline to completion. A pipeline runs at most once.
    ///
    /// When several stages fail, the source error wins over schema, sink
    /// and protocol errors, which win over a failed close. The others are
    /// logged.
    pub async fn run(&mut self) -> Result<PipelineStats, PipelineError> {
        let (Some(source), Some(sink)) = (self.source.take(), self.sink.take()) else {
            return AlreadyRunSnafu.fail();
        };

        let span = self.span.clone();
        let result = self.execute(source, sink).instrument(span).await;

        let status = match &result {
            Ok(stats) if stats.cancelled => RunStatus::Cancelled,
            Ok(_) => RunStatus::Success,
            Err(e) => {
                emit!(PipelineFailed { stage: e.stage() });
                RunStatus::Failed
            }
        };
        self.state.set(match status {
            RunStatus::Failed => PipelineState::Failed,
            _ => PipelineState::Closed,
        });

        result
    }

    async fn execute(&self, source: S, sink: K) -> Result<PipelineStats, PipelineError> {
        let start = Instant::now();
        self.state.set(PipelineState::Running);
        info!(
            "Starting pipeline (channel capacity {})",
            self.settings.channel_capacity
        );

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);

        let producer = tokio::task::spawn_blocking({
            let query = self.query.clone();
            let shutdown = self.shutdown.clone();
            let state = self.state.clone();
            let span = info_span!(parent: &self.span, "producer");
            move || tasks::run_producer(source, query, tx, shutdown, state, span)
        });

        let consumer = tokio::task::spawn_blocking({
            let builder = SchemaBuilder::new(self.settings.table_name.clone());
            let span = info_span!(parent: &self.span, "consumer");
            move || tasks::run_consumer(rx, sink, builder, span)
        });

        let (producer_joined, consumer_joined) = tokio::join!(producer, consumer);

        // Without the sink there is nothing left to close; dropping it
        // during the panic already finalized what it could.
        let (mut sink, consumer_result) = consumer_joined.context(TaskJoinSnafu {
            worker: "consumer",
        })?;
        let producer_result = producer_joined
            .context(TaskJoinSnafu { worker: "producer" })
            .and_then(|result| result);

        debug!("Workers joined, closing sink");
        let close_result = tokio::task::spawn_blocking(move || sink.close())
            .await
            .context(TaskJoinSnafu { worker: "close" })
            .and_then(|result| result.context(SinkCloseSnafu));

        let elapsed = start.elapsed();

        let stats = match (producer_result, consumer_result, close_result) {
            (Ok(produced), Ok(consumed), Ok(summary)) => PipelineStats {
                rows_read: produced.rows_read,
                rows_written: consumed.rows_written,
                cells_nulled: consumed.cells_nulled,
                elapsed,
                cancelled: produced.cancelled,
                sink: summary,
            },
            (producer, consumer, close) => {
                let mut errors = [producer.err(), consumer.err(), close.err()]
                    .into_iter()
                    .flatten();
                // At least one of the three failed.
                let primary = errors.next().unwrap_or(PipelineError::SinkLost);
                for secondary in errors {
                    warn!("Additional failure during run ({}): {}", secondary.stage(), secondary);
                }
                error!(
                    stage = primary.stage(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Pipeline failed: {}",
                    primary
                );
                emit!(PipelineCompleted {
                    status: RunStatus::Failed,
                    duration: elapsed,
                });
                return Err(primary);
            }
        };

        emit!(ExtractBytesWritten {
            bytes: stats.sink.bytes
        });
        emit!(PipelineCompleted {
            status: if stats.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Success
            },
            duration: elapsed,
        });
        info!(
            rows_read = stats.rows_read,
            rows_written = stats.rows_written,
            cells_nulled = stats.cells_nulled,
            cancelled = stats.cancelled,
            elapsed_ms = elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        Ok(stats)
    }
}

/// Inputs of one extract run, as given on the command line.
#[derive(Debug, Clone)]
pub struct ExtractJob {
    pub extract: PathBuf,
    pub connection: ConnectionParams,
    pub query: Query,
}

/// Run `job` against the built-in source and Parquet extract, stopping
/// gracefully on SIGINT, SIGTERM or SIGQUIT.
pub async fn run_pipeline(config: Config, job: ExtractJob) -> Result<PipelineStats, PipelineError> {
    let source = open_source(&job.connection).context(SourceReadSnafu)?;
    info!("Source: {}", job.connection);

    let extract_path = job.extract.clone();
    let extract_config = config.sink.extract_config();
    let sink = tokio::task::spawn_blocking(move || {
        ParquetExtract::create(&extract_path, extract_config)
    })
    .await
    .context(TaskJoinSnafu { worker: "sink_open" })?
    .context(SinkOpenSnafu)?;
    info!("Extract: {}", job.extract.display());

    let shutdown = CancellationToken::new();
    let mut pipeline = Pipeline::new(
        source,
        sink,
        job.query,
        PipelineSettings::from_config(&config),
    )
    .with_span(info_span!("pipeline", extract = %job.extract.display()))
    .with_shutdown(shutdown.clone());

    let watcher = tokio::spawn(cancel_on_signal(shutdown));
    let result = pipeline.run().await;
    watcher.abort();

    result
}
