//! Export Pipeline - stream a projection out of the store as delimited text
//!
//! The store renders the result with a header row and the caller's
//! delimiter; chunks are relayed as they arrive. Nothing already written to
//! a sink is rolled back on failure. `export_to_path` is the variant that
//! publishes only complete output.

use super::{Direction, RowVisitor, TransferJob};
use crate::catalog::CatalogClient;
use crate::codec::{preview_source, AsyncRecordReader, Preview, RecordCounter};
use crate::config::Delimiter;
use crate::error::{BridgeError, Result};
use crate::query::ProjectionQuery;
use crate::store::{
    fail_on_trailing_exception, ByteStream, Setting, StoreTransport, DELIMITED_WITH_HEADER,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{info, Instrument};

/// Rows a preview materializes unless told otherwise.
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

/// What to export: a projection built here, or a caller-supplied SELECT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportRequest {
    Projection(ProjectionQuery),
    Sql(String),
}

impl ExportRequest {
    /// Plain single-table projection.
    pub fn columns<S: Into<String>>(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        let columns = columns.into_iter().map(Into::into).collect();
        ExportRequest::Projection(ProjectionQuery::new(table, columns))
    }

    fn label(&self) -> &str {
        match self {
            ExportRequest::Projection(query) => &query.table,
            ExportRequest::Sql(_) => "<query>",
        }
    }

    fn to_sql(&self, limit: Option<usize>) -> Result<String> {
        match (self, limit) {
            (ExportRequest::Projection(query), None) => query.to_sql(),
            (ExportRequest::Projection(query), Some(limit)) => {
                query.clone().with_limit(limit as u64).to_sql()
            }
            (ExportRequest::Sql(sql), None) => Ok(trim_statement(sql)?.to_string()),
            (ExportRequest::Sql(sql), Some(limit)) => {
                Ok(format!("SELECT * FROM ({}) LIMIT {}", trim_statement(sql)?, limit))
            }
        }
    }
}

impl From<ProjectionQuery> for ExportRequest {
    fn from(query: ProjectionQuery) -> Self {
        ExportRequest::Projection(query)
    }
}

fn trim_statement(sql: &str) -> Result<&str> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(BridgeError::Schema("export query must not be empty".to_string()));
    }
    Ok(trimmed)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Data rows, header excluded.
    pub rows: u64,
    pub bytes: u64,
}

async fn open_stream<T>(
    client: &CatalogClient<T>,
    request: &ExportRequest,
    delimiter: Delimiter,
    limit: Option<usize>,
) -> Result<ByteStream>
where
    T: StoreTransport,
{
    let sql = format!("{} FORMAT {}", request.to_sql(limit)?, DELIMITED_WITH_HEADER);
    let settings: Vec<Setting> = vec![(
        "format_csv_delimiter".to_string(),
        delimiter.as_char().to_string(),
    )];
    let body = client.transport().query_stream(&sql, &settings).await?;
    Ok(fail_on_trailing_exception(body))
}

/// Relay the export into `sink`, flushing it at the end.
pub async fn export<T, W>(
    client: &CatalogClient<T>,
    request: &ExportRequest,
    delimiter: Delimiter,
    sink: &mut W,
) -> Result<ExportSummary>
where
    T: StoreTransport,
    W: AsyncWrite + Unpin + ?Sized,
{
    let job = TransferJob::new(Direction::Export, request.label());
    let span = job.span();
    async move {
        let mut stream = open_stream(client, request, delimiter, None).await?;
        let mut counter = RecordCounter::new();
        let mut bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            counter.update(&chunk);
            bytes += chunk.len() as u64;
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;

        let summary = ExportSummary {
            rows: counter.count().saturating_sub(1),
            bytes,
        };
        info!(rows = summary.rows, bytes, elapsed_ms = job.elapsed_ms(), "Export complete");
        Ok(summary)
    }
    .instrument(span)
    .await
}

/// Drive `visitor` over the header and every row. Returns the row count.
pub async fn export_rows<T, V>(
    client: &CatalogClient<T>,
    request: &ExportRequest,
    delimiter: Delimiter,
    visitor: &mut V,
) -> Result<u64>
where
    T: StoreTransport,
    V: RowVisitor + ?Sized,
{
    let job = TransferJob::new(Direction::Export, request.label());
    let span = job.span();
    async move {
        let stream = open_stream(client, request, delimiter, None).await?;
        let mut reader = AsyncRecordReader::new(StreamReader::new(stream), delimiter);

        let headers = reader
            .read_record()
            .await?
            .ok_or_else(|| BridgeError::Schema("export returned no header row".to_string()))?;
        visitor.visit_header(&headers)?;

        let mut rows = 0u64;
        while let Some(row) = reader.read_record().await? {
            visitor.visit_row(&row)?;
            rows += 1;
        }
        info!(rows, elapsed_ms = job.elapsed_ms(), "Row export complete");
        Ok(rows)
    }
    .instrument(span)
    .await
}

/// Header and at most `limit` rows, materialized.
pub async fn preview<T>(
    client: &CatalogClient<T>,
    request: &ExportRequest,
    delimiter: Delimiter,
    limit: usize,
) -> Result<Preview>
where
    T: StoreTransport,
{
    let stream = open_stream(client, request, delimiter, Some(limit)).await?;
    preview_source(StreamReader::new(stream), delimiter, limit).await
}

/// Export into a temporary file next to `path` and move it into place only
/// once the whole export succeeded.
pub async fn export_to_path<T>(
    client: &CatalogClient<T>,
    request: &ExportRequest,
    delimiter: Delimiter,
    path: &Path,
) -> Result<ExportSummary>
where
    T: StoreTransport,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".tablebridge-export-")
        .tempfile_in(dir)?;
    let mut file = tokio::fs::File::from_std(staging.reopen()?);

    let summary = export(client, request, delimiter, &mut file).await?;
    file.sync_all().await?;
    drop(file);

    staging
        .persist(path)
        .map_err(|e| {
            BridgeError::Transfer(format!("failed to publish {}: {}", path.display(), e.error))
        })?;
    Ok(summary)
}
