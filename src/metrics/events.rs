//! Internal events for metrics emission.
//!
//! Each struct is a measurable occurrence in an extract run. Emitting one
//! records the matching metric; without an installed recorder this is a
//! no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    fn emit(self);
}

/// Rows pulled from the source by the producer.
pub struct RowsRead {
    pub count: u64,
}

impl InternalEvent for RowsRead {
    fn emit(self) {
        counter!("sqlextract_rows_read_total").increment(self.count);
    }
}

/// Rows accepted by the extract sink.
pub struct RowsWritten {
    pub count: u64,
}

impl InternalEvent for RowsWritten {
    fn emit(self) {
        counter!("sqlextract_rows_written_total").increment(self.count);
    }
}

/// Cells replaced by null during coercion.
pub struct CellsNulled {
    pub count: u64,
}

impl InternalEvent for CellsNulled {
    fn emit(self) {
        trace!(count = self.count, "Cells nulled");
        counter!("sqlextract_cells_nulled_total").increment(self.count);
    }
}

/// Messages waiting in the producer/consumer channel.
pub struct ChannelDepth {
    pub depth: usize,
}

impl InternalEvent for ChannelDepth {
    fn emit(self) {
        gauge!("sqlextract_channel_depth").set(self.depth as f64);
    }
}

/// A batch of rows encoded and written to the extract file.
pub struct ExtractBatchFlushed {
    pub rows: u64,
    pub duration: Duration,
}

impl InternalEvent for ExtractBatchFlushed {
    fn emit(self) {
        trace!(rows = self.rows, duration_ms = self.duration.as_millis() as u64, "Batch flushed");
        counter!("sqlextract_batches_written_total").increment(1);
        histogram!("sqlextract_batch_flush_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Bytes in the finished extract file.
pub struct ExtractBytesWritten {
    pub bytes: u64,
}

impl InternalEvent for ExtractBytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, "Extract bytes written");
        counter!("sqlextract_bytes_written_total").increment(self.bytes);
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

/// A pipeline run reached a terminal state.
pub struct PipelineCompleted {
    pub status: RunStatus,
    pub duration: Duration,
}

impl InternalEvent for PipelineCompleted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Pipeline completed");
        counter!("sqlextract_runs_total", "status" => self.status.as_str()).increment(1);
        histogram!("sqlextract_run_duration_seconds", "status" => self.status.as_str())
            .record(self.duration.as_secs_f64());
    }
}

/// A run failed at the given stage.
pub struct PipelineFailed {
    pub stage: &'static str,
}

impl InternalEvent for PipelineFailed {
    fn emit(self) {
        counter!("sqlextract_failures_total", "stage" => self.stage).increment(1);
    }
}
