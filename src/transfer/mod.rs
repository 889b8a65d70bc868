//! Transfer Engine - streaming export and import jobs
//!
//! Every job runs inside its own span tagged with a job id. A job is
//! sequential apart from the re-projecting import, which runs a producer task
//! alongside the bulk insert.

pub mod batch;
pub mod export;
pub mod import;
mod pipe;

pub use export::{
    export, export_rows, export_to_path, preview, ExportRequest, ExportSummary,
    DEFAULT_PREVIEW_LIMIT,
};
pub use import::{import, ImportMode, ImportOptions, ImportStrategy, ImportSummary};

use crate::codec::{Row, READ_BUFFER_SIZE};
use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Size of the chunks handed to the store.
pub const CHUNK_SIZE: usize = READ_BUFFER_SIZE;

/// Chunks the re-projecting pipe may hold before the producer waits.
pub const PIPE_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Export,
    Import,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Export => write!(f, "export"),
            Direction::Import => write!(f, "import"),
        }
    }
}

/// Identity of one export or import.
#[derive(Clone, Debug, Serialize)]
pub struct TransferJob {
    pub id: Uuid,
    pub direction: Direction,
    pub table: String,
    pub started_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(direction: Direction, table: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            table: table.into(),
            started_at: Utc::now(),
        }
    }

    pub fn span(&self) -> Span {
        info_span!(
            "transfer",
            job_id = %self.id,
            direction = %self.direction,
            table = %self.table
        )
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

/// Per-row callback for exports.
///
/// Called synchronously in source order. An error stops the export and is
/// returned from it.
pub trait RowVisitor {
    fn visit_header(&mut self, _headers: &[String]) -> Result<()> {
        Ok(())
    }

    fn visit_row(&mut self, row: &[String]) -> Result<()>;
}

/// Closures see data rows only.
impl<F> RowVisitor for F
where
    F: FnMut(&[String]) -> Result<()>,
{
    fn visit_row(&mut self, row: &[String]) -> Result<()> {
        self(row)
    }
}

/// A data row must have exactly as many fields as the header.
pub(crate) fn check_width(row: &Row, expected: usize, line: u64) -> Result<()> {
    if row.len() == expected {
        Ok(())
    } else {
        Err(BridgeError::malformed(
            line,
            format!("expected {} fields, found {}", expected, row.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        headers: Vec<String>,
        rows: Vec<Row>,
    }

    impl RowVisitor for Collect {
        fn visit_header(&mut self, headers: &[String]) -> Result<()> {
            self.headers = headers.to_vec();
            Ok(())
        }

        fn visit_row(&mut self, row: &[String]) -> Result<()> {
            self.rows.push(row.to_vec());
            Ok(())
        }
    }

    fn drive<V: RowVisitor>(visitor: &mut V) -> Result<()> {
        visitor.visit_header(&["id".to_string()])?;
        visitor.visit_row(&["1".to_string()])?;
        visitor.visit_row(&["2".to_string()])
    }

    #[test]
    fn test_visitors() {
        let mut collect = Collect { headers: Vec::new(), rows: Vec::new() };
        drive(&mut collect).unwrap();
        assert_eq!(collect.headers, vec!["id"]);
        assert_eq!(collect.rows.len(), 2);

        let mut seen = 0;
        let mut closure = |_row: &[String]| -> Result<()> {
            seen += 1;
            Ok(())
        };
        drive(&mut closure).unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_check_width() {
        let row = vec!["a".to_string(), "b".to_string()];
        assert!(check_width(&row, 2, 3).is_ok());
        match check_width(&row, 3, 7) {
            Err(BridgeError::MalformedRecord { line, .. }) => assert_eq!(line, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = TransferJob::new(Direction::Import, "t");
        let b = TransferJob::new(Direction::Import, "t");
        assert_ne!(a.id, b.id);
        assert_eq!(a.direction.to_string(), "import");
    }
}
