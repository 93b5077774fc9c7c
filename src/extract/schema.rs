//! Schema construction from first-row metadata.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;

use super::{ColumnDescriptor, ColumnMeta, Schema, SchemaRef, map_type};
use crate::error::{EmptyMetadataSnafu, RegisterSnafu, SchemaError};
use crate::sink::ExtractSink;

/// Default name of the single table in an extract.
pub const DEFAULT_TABLE_NAME: &str = "Extract";

/// Builds the extract schema and registers it with the sink.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    table_name: String,
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_NAME)
    }
}

impl SchemaBuilder {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Map `metadata` to column descriptors without touching a sink.
    pub fn describe(metadata: &[ColumnMeta]) -> Result<Schema, SchemaError> {
        ensure!(!metadata.is_empty(), EmptyMetadataSnafu);

        let columns = metadata
            .iter()
            .map(|meta| {
                ColumnDescriptor::new(
                    meta.name.clone(),
                    meta.source_type.clone(),
                    map_type(&meta.source_type),
                )
            })
            .collect();

        Ok(Schema::new(columns))
    }

    /// Build the schema for `metadata` and register it as the sink's table.
    ///
    /// Registration happens before this returns, so rows coerced against the
    /// returned schema can be inserted right away.
    pub fn build<S>(&self, metadata: &[ColumnMeta], sink: &mut S) -> Result<SchemaRef, SchemaError>
    where
        S: ExtractSink + ?Sized,
    {
        let schema = Arc::new(Self::describe(metadata)?);

        for (index, column) in schema.columns().iter().enumerate() {
            debug!(
                "  [{}] {}: {:?} -> {}",
                index,
                column.name(),
                column.source_type(),
                column.extract_type()
            );
        }

        sink.add_table(&self.table_name, Arc::clone(&schema))
            .context(RegisterSnafu {
                table: self.table_name.clone(),
            })?;

        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::extract::{ExtractType, SourceType, TypedRow};
    use crate::sink::SinkSummary;

    #[derive(Default)]
    struct TableRecorder {
        tables: Vec<(String, SchemaRef)>,
        reject: bool,
    }

    impl ExtractSink for TableRecorder {
        fn add_table(&mut self, name: &str, schema: SchemaRef) -> Result<(), SinkError> {
            if self.reject {
                return Err(SinkError::TableExists {
                    name: name.to_string(),
                    existing: name.to_string(),
                });
            }
            self.tables.push((name.to_string(), schema));
            Ok(())
        }

        fn insert(&mut self, _row: TypedRow) -> Result<(), SinkError> {
            Ok(())
        }

        fn close(&mut self) -> Result<SinkSummary, SinkError> {
            Ok(SinkSummary::default())
        }
    }

    fn metadata() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("id", SourceType::Integer),
            ColumnMeta::new("name", SourceType::Text),
            ColumnMeta::new("id", SourceType::Float),
            ColumnMeta::new("shape", SourceType::Other("GEOMETRY".to_string())),
        ]
    }

    #[test]
    fn test_build_preserves_order_and_length() {
        let mut sink = TableRecorder::default();
        let schema = SchemaBuilder::default().build(&metadata(), &mut sink).unwrap();

        assert_eq!(schema.len(), 4);
        let names: Vec<_> = schema.columns().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["id", "name", "id", "shape"]);
        let types: Vec<_> = schema.extract_types().collect();
        assert_eq!(
            types,
            vec![
                ExtractType::Integer,
                ExtractType::UnicodeString,
                ExtractType::Double,
                ExtractType::UnicodeString,
            ]
        );
    }

    #[test]
    fn test_build_registers_once_with_table_name() {
        let mut sink = TableRecorder::default();
        let schema = SchemaBuilder::new("Orders")
            .build(&metadata(), &mut sink)
            .unwrap();

        assert_eq!(sink.tables.len(), 1);
        assert_eq!(sink.tables[0].0, "Orders");
        assert!(Arc::ptr_eq(&sink.tables[0].1, &schema));
    }

    #[test]
    fn test_empty_metadata_is_rejected_before_registration() {
        let mut sink = TableRecorder::default();
        let err = SchemaBuilder::default().build(&[], &mut sink).unwrap_err();

        assert!(matches!(err, SchemaError::EmptyMetadata));
        assert!(sink.tables.is_empty());
    }

    #[test]
    fn test_sink_rejection_propagates() {
        let mut sink = TableRecorder {
            reject: true,
            ..Default::default()
        };
        let err = SchemaBuilder::default()
            .build(&metadata(), &mut sink)
            .unwrap_err();

        match err {
            SchemaError::Register { table, .. } => assert_eq!(table, "Extract"),
            other => panic!("Expected Register error, got {:?}", other),
        }
    }
}
