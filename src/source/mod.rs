//! Query sources.
//!
//! A source executes one query and hands rows to a visitor as they are
//! fetched, so the result set is never materialised. The visitor sees the
//! column metadata alongside every row; sources report no metadata for a
//! result with zero rows.

pub mod connection;
pub mod duckdb_source;

use snafu::prelude::*;
use std::fmt;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::PathBuf;

use crate::error::{QueryFileNotFoundSnafu, ReadQueryFileSnafu, SourceError};
use crate::extract::{ColumnMeta, RawRow};

pub use connection::{ConnectionParams, open_source};
pub use duckdb_source::DuckDbSource;

/// Callback receiving each fetched row. Returning `Break` stops the query.
pub type RowVisitor<'a> = dyn FnMut(&[ColumnMeta], RawRow) -> ControlFlow<()> + 'a;

/// A database session able to run queries.
///
/// Sources are driven from a single blocking worker, so they need `Send`
/// but not `Sync`.
pub trait QuerySource: Send {
    /// Execute `query` and pass every row to `visit` in result order.
    ///
    /// Returns the number of rows handed to the visitor.
    fn query(&mut self, query: &str, visit: &mut RowVisitor<'_>) -> Result<usize, SourceError>;

    /// Run a statement inside a transaction and return the affected row count.
    ///
    /// Commits on success and rolls back on failure.
    fn execute_non_query(&mut self, statement: &str) -> Result<usize, SourceError>;
}

impl<S: QuerySource + ?Sized> QuerySource for Box<S> {
    fn query(&mut self, query: &str, visit: &mut RowVisitor<'_>) -> Result<usize, SourceError> {
        (**self).query(query, visit)
    }

    fn execute_non_query(&mut self, statement: &str) -> Result<usize, SourceError> {
        (**self).execute_non_query(statement)
    }
}

/// Query to run: literal text or a UTF-8 file holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Text(String),
    File(PathBuf),
}

impl Query {
    /// Load the query text.
    pub fn resolve(&self) -> Result<String, SourceError> {
        match self {
            Query::Text(text) => Ok(text.clone()),
            Query::File(path) => match std::fs::read_to_string(path) {
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    QueryFileNotFoundSnafu { path: path.clone() }.fail()
                }
                result => result.context(ReadQueryFileSnafu { path: path.clone() }),
            },
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Text(_) => f.write_str("<inline query>"),
            Query::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_resolve_text() {
        let query = Query::Text("SELECT 1".to_string());
        assert_eq!(query.resolve().unwrap(), "SELECT 1");
    }

    #[test]
    fn test_resolve_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "SELECT 1 AS id").unwrap();

        let query = Query::File(file.path().to_path_buf());
        assert_eq!(query.resolve().unwrap(), "SELECT 1 AS id");
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.sql");

        let err = Query::File(path.clone()).resolve().unwrap_err();
        match err {
            SourceError::QueryFileNotFound { path: reported } => assert_eq!(reported, path),
            other => panic!("Expected QueryFileNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_non_utf8_file_is_unreadable() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xff, 0xfe, 0x00]).unwrap();

        let err = Query::File(file.path().to_path_buf()).resolve().unwrap_err();
        assert!(matches!(err, SourceError::ReadQueryFile { .. }));
    }
}
