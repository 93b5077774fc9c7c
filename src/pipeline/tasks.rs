//! Producer and consumer workers.
//!
//! Both run on Tokio's blocking pool: the source and sink do synchronous
//! I/O, and the channel between them is driven with `blocking_send` /
//! `blocking_recv`. End of stream is the producer dropping its sender.

use snafu::prelude::*;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, trace};

use super::StateHandle;
use crate::emit;
use crate::error::{
    PipelineError, ProtocolSnafu, SchemaRegistrationSnafu, SinkWriteSnafu, SourceReadSnafu,
};
use crate::extract::{ColumnMeta, RawRow, RowCoercer, SchemaBuilder};
use crate::metrics::events::{CellsNulled, ChannelDepth, RowsRead, RowsWritten};
use crate::sink::ExtractSink;
use crate::source::{Query, QuerySource};

/// Message passed from producer to consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMessage {
    /// Column metadata. Always the first message, sent at most once.
    Metadata(Vec<ColumnMeta>),
    /// One source row, in source order.
    Row(RawRow),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct ProducerStats {
    pub rows_read: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct ConsumerStats {
    pub rows_written: usize,
    pub cells_nulled: u64,
}

/// Run the query and forward metadata and rows into `tx`.
///
/// Stops quietly when the consumer hangs up or `shutdown` fires. The sender
/// is dropped before returning, which the consumer sees as end of stream.
pub(super) fn run_producer<S: QuerySource>(
    mut source: S,
    query: Query,
    tx: mpsc::Sender<PipelineMessage>,
    shutdown: CancellationToken,
    state: StateHandle,
    span: Span,
) -> Result<ProducerStats, PipelineError> {
    let _entered = span.enter();
    debug!("Producer started");

    let result = produce(&mut source, &query, tx, &shutdown);

    match &result {
        Ok(stats) => {
            state.begin_draining();
            info!(
                rows = stats.rows_read,
                cancelled = stats.cancelled,
                "Producer finished"
            );
        }
        Err(e) => debug!("Producer stopped: {}", e),
    }
    result
}

fn produce<S: QuerySource>(
    source: &mut S,
    query: &Query,
    tx: mpsc::Sender<PipelineMessage>,
    shutdown: &CancellationToken,
) -> Result<ProducerStats, PipelineError> {
    let text = query.resolve().context(SourceReadSnafu)?;
    let mut stats = ProducerStats::default();

    if shutdown.is_cancelled() {
        stats.cancelled = true;
        return Ok(stats);
    }

    let mut metadata_sent = false;
    source
        .query(&text, &mut |metadata, row| {
            if shutdown.is_cancelled() {
                stats.cancelled = true;
                return ControlFlow::Break(());
            }

            if !metadata_sent {
                debug!("Sending metadata for {} columns", metadata.len());
                if tx
                    .blocking_send(PipelineMessage::Metadata(metadata.to_vec()))
                    .is_err()
                {
                    return ControlFlow::Break(());
                }
                metadata_sent = true;
            }

            match tx.blocking_send(PipelineMessage::Row(row)) {
                Ok(()) => {
                    stats.rows_read += 1;
                    emit!(RowsRead { count: 1 });
                    ControlFlow::Continue(())
                }
                Err(_) => {
                    debug!("Consumer hung up, stopping source");
                    ControlFlow::Break(())
                }
            }
        })
        .context(SourceReadSnafu)?;

    if stats.cancelled {
        info!("Shutdown requested, stopped reading after {} rows", stats.rows_read);
    }
    Ok(stats)
}

/// Receive messages, register the schema and insert coerced rows.
///
/// The sink is handed back with the outcome so the orchestrator can close
/// it whether or not consumption succeeded.
pub(super) fn run_consumer<K: ExtractSink>(
    mut rx: mpsc::Receiver<PipelineMessage>,
    mut sink: K,
    builder: SchemaBuilder,
    span: Span,
) -> (K, Result<ConsumerStats, PipelineError>) {
    let _entered = span.enter();
    debug!("Consumer started");

    let result = consume(&mut rx, &mut sink, &builder);
    // Closing the receiver lets a producer blocked on a full channel exit.
    rx.close();
    drop(rx);

    match &result {
        Ok(stats) => info!(
            rows = stats.rows_written,
            cells_nulled = stats.cells_nulled,
            "Consumer finished"
        ),
        Err(e) => debug!("Consumer stopped: {}", e),
    }
    (sink, result)
}

fn consume<K: ExtractSink>(
    rx: &mut mpsc::Receiver<PipelineMessage>,
    sink: &mut K,
    builder: &SchemaBuilder,
) -> Result<ConsumerStats, PipelineError> {
    let mut stats = ConsumerStats::default();

    let mut coercer = match rx.blocking_recv() {
        None => {
            info!("Source returned no rows, no table registered");
            return Ok(stats);
        }
        Some(PipelineMessage::Metadata(metadata)) => {
            let schema = builder
                .build(&metadata, sink)
                .context(SchemaRegistrationSnafu)?;
            info!(
                "Registered table '{}' with {} columns",
                builder.table_name(),
                schema.len()
            );
            RowCoercer::new(schema)
        }
        Some(PipelineMessage::Row(_)) => {
            return ProtocolSnafu {
                message: "received a data row before column metadata",
            }
            .fail();
        }
    };

    while let Some(message) = rx.blocking_recv() {
        emit!(ChannelDepth { depth: rx.len() });

        let raw = match message {
            PipelineMessage::Row(raw) => raw,
            PipelineMessage::Metadata(_) => {
                return ProtocolSnafu {
                    message: "received column metadata twice",
                }
                .fail();
            }
        };

        let nulled_before = coercer.cells_nulled();
        let row = coercer.coerce(raw);
        let nulled = coercer.cells_nulled() - nulled_before;
        if nulled > 0 {
            trace!(row = stats.rows_written, cells = nulled, "Coercion nulled cells");
            emit!(CellsNulled { count: nulled });
        }

        sink.insert(row).context(SinkWriteSnafu)?;
        stats.rows_written += 1;
        stats.cells_nulled = coercer.cells_nulled();
        emit!(RowsWritten { count: 1 });
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SinkError, SourceError};
    use crate::extract::{Cell, RawValue, SchemaRef, SourceType, TypedRow};
    use crate::sink::SinkSummary;

    #[derive(Default)]
    struct VecSink {
        tables: usize,
        rows: Vec<TypedRow>,
    }

    impl ExtractSink for VecSink {
        fn add_table(&mut self, _name: &str, _schema: SchemaRef) -> Result<(), SinkError> {
            self.tables += 1;
            Ok(())
        }

        fn insert(&mut self, row: TypedRow) -> Result<(), SinkError> {
            self.rows.push(row);
            Ok(())
        }

        fn close(&mut self) -> Result<SinkSummary, SinkError> {
            Ok(SinkSummary::default())
        }
    }

    struct RowsSource {
        metadata: Vec<ColumnMeta>,
        rows: Vec<RawRow>,
    }

    impl QuerySource for RowsSource {
        fn query(
            &mut self,
            _query: &str,
            visit: &mut crate::source::RowVisitor<'_>,
        ) -> Result<usize, SourceError> {
            let mut visited = 0;
            for row in self.rows.drain(..) {
                visited += 1;
                if visit(&self.metadata, row).is_break() {
                    break;
                }
            }
            Ok(visited)
        }

        fn execute_non_query(&mut self, _statement: &str) -> Result<usize, SourceError> {
            Ok(0)
        }
    }

    fn consume_all(messages: Vec<PipelineMessage>) -> (VecSink, Result<ConsumerStats, PipelineError>) {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            tx.try_send(message).unwrap();
        }
        drop(tx);
        run_consumer(rx, VecSink::default(), SchemaBuilder::default(), Span::none())
    }

    #[test]
    fn test_row_before_metadata_is_protocol_error() {
        let (sink, result) = consume_all(vec![PipelineMessage::Row(vec![RawValue::Integer(1)])]);

        assert!(matches!(result, Err(PipelineError::Protocol { .. })));
        assert_eq!(sink.tables, 0);
    }

    #[test]
    fn test_second_metadata_is_protocol_error() {
        let metadata = vec![ColumnMeta::new("id", SourceType::Integer)];
        let (sink, result) = consume_all(vec![
            PipelineMessage::Metadata(metadata.clone()),
            PipelineMessage::Row(vec![RawValue::Integer(1)]),
            PipelineMessage::Metadata(metadata),
        ]);

        assert!(matches!(result, Err(PipelineError::Protocol { .. })));
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn test_end_without_metadata_registers_nothing() {
        let (sink, result) = consume_all(vec![]);

        assert_eq!(result.unwrap(), ConsumerStats::default());
        assert_eq!(sink.tables, 0);
    }

    #[test]
    fn test_consumer_counts_nulled_cells() {
        let (sink, result) = consume_all(vec![
            PipelineMessage::Metadata(vec![
                ColumnMeta::new("id", SourceType::Integer),
                ColumnMeta::new("name", SourceType::Text),
            ]),
            PipelineMessage::Row(vec![RawValue::Integer(1), RawValue::Text("Alice".into())]),
            PipelineMessage::Row(vec![RawValue::Text("x".into()), RawValue::Text("Bob".into())]),
        ]);

        let stats = result.unwrap();
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.cells_nulled, 1);
        assert_eq!(sink.rows[1].cells()[0], Cell::Null);
    }

    #[test]
    fn test_producer_sends_metadata_once_then_rows() {
        let source = RowsSource {
            metadata: vec![ColumnMeta::new("n", SourceType::Integer)],
            rows: (0..3).map(|i| vec![RawValue::Integer(i)]).collect(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let state = StateHandle::default();
        state.set(super::super::PipelineState::Running);

        let stats = run_producer(
            source,
            Query::Text("SELECT n".to_string()),
            tx,
            CancellationToken::new(),
            state.clone(),
            Span::none(),
        )
        .unwrap();

        assert_eq!(stats.rows_read, 3);
        assert_eq!(state.get(), super::super::PipelineState::Draining);

        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], PipelineMessage::Metadata(_)));
        assert_eq!(messages[3], PipelineMessage::Row(vec![RawValue::Integer(2)]));
    }

    #[test]
    fn test_producer_stops_when_consumer_hangs_up() {
        let source = RowsSource {
            metadata: vec![ColumnMeta::new("n", SourceType::Integer)],
            rows: (0..10).map(|i| vec![RawValue::Integer(i)]).collect(),
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let stats = run_producer(
            source,
            Query::Text("SELECT n".to_string()),
            tx,
            CancellationToken::new(),
            StateHandle::default(),
            Span::none(),
        )
        .unwrap();

        assert_eq!(stats.rows_read, 0);
        assert!(!stats.cancelled);
    }

    #[test]
    fn test_cancelled_producer_reads_nothing() {
        let source = RowsSource {
            metadata: vec![ColumnMeta::new("n", SourceType::Integer)],
            rows: vec![vec![RawValue::Integer(1)]],
        };
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = run_producer(
            source,
            Query::Text("SELECT n".to_string()),
            tx,
            shutdown,
            StateHandle::default(),
            Span::none(),
        )
        .unwrap();

        assert!(stats.cancelled);
        assert_eq!(stats.rows_read, 0);
        assert!(rx.try_recv().is_err());
    }
}
