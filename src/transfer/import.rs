//! Import Pipeline - stream a delimited source into a store table
//!
//! Three ways in:
//! - direct: the source bytes go to the bulk-insert channel untouched and
//!   the store maps columns by header name
//! - re-projecting: a producer task keeps the selected columns and feeds
//!   the bulk insert through a bounded pipe
//! - batched: `INSERT ... VALUES` statements, for stores without a
//!   bulk-insert channel
//!
//! Row counts come from parsing on the last two paths. The direct path uses
//! the store's own count and, when the store reports none, the difference in
//! `count()` before and after the insert. That difference is only accurate
//! while nobody else writes to the table.

use super::batch::{insert_batched, DEFAULT_BATCH_SIZE};
use super::pipe::{spawn_producer, Projection, OUTPUT_DELIMITER};
use super::{Direction, TransferJob, CHUNK_SIZE};
use crate::catalog::CatalogClient;
use crate::codec::{peek_header, AsyncRecordReader, Row};
use crate::config::Delimiter;
use crate::error::{BridgeError, Result};
use crate::query::DEFAULT_COLUMN_TYPE;
use crate::store::{ByteStream, InsertRequest, StoreTransport};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Which path the caller wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// Direct when possible, re-projecting otherwise, batched without a
    /// bulk-insert channel.
    #[default]
    Auto,
    /// Bulk-insert channel only; fails if the store has none.
    BulkInsert,
    BatchedSql,
}

/// The path an import actually took.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Direct,
    Reprojecting,
    Batched,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Source columns to import, in table order. `None` imports all of them.
    pub selected_columns: Option<Vec<String>>,
    /// Column types for a created table; missing entries use `String`.
    pub column_types: HashMap<String, String>,
    /// Create the table first if it does not exist.
    pub create_table: bool,
    pub strategy: ImportStrategy,
    /// Rows per statement on the batched path.
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            selected_columns: None,
            column_types: HashMap::new(),
            create_table: true,
            strategy: ImportStrategy::Auto,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ImportOptions {
    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.selected_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_type(mut self, column: impl Into<String>, column_type: impl Into<String>) -> Self {
        self.column_types.insert(column.into(), column_type.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ImportStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn without_table_creation(mut self) -> Self {
        self.create_table = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub rows: u64,
    pub strategy: ImportMode,
    pub table_created: bool,
}

fn validate_header(header: &Row) -> Result<()> {
    if header.is_empty() {
        return Err(BridgeError::Schema("header row has no columns".to_string()));
    }
    let mut seen = HashSet::new();
    for (idx, name) in header.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(BridgeError::Schema(format!("header column {} has no name", idx + 1)));
        }
        if !seen.insert(name.as_str()) {
            return Err(BridgeError::Schema(format!("duplicate header column {:?}", name)));
        }
    }
    Ok(())
}

/// Source index of each selected column, in selection order.
fn resolve_selection(header: &Row, selected: Option<&[String]>) -> Result<Vec<usize>> {
    let selected = match selected {
        None => return Ok((0..header.len()).collect()),
        Some(selected) => selected,
    };
    if selected.is_empty() {
        return Err(BridgeError::Schema("no columns selected for import".to_string()));
    }

    let mut seen = HashSet::new();
    selected
        .iter()
        .map(|column| {
            if !seen.insert(column.as_str()) {
                return Err(BridgeError::Schema(format!("column {:?} selected twice", column)));
            }
            header
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| {
                    BridgeError::Schema(format!("column {:?} is not in the source header", column))
                })
        })
        .collect()
}

fn is_identity(indices: &[usize], width: usize) -> bool {
    indices.len() == width && indices.iter().enumerate().all(|(pos, &idx)| pos == idx)
}

fn choose_mode(
    strategy: ImportStrategy,
    identity: bool,
    delimiter: Delimiter,
    bulk_available: bool,
) -> Result<ImportMode> {
    let streamed = if identity && !delimiter.is_whitespace() {
        ImportMode::Direct
    } else {
        ImportMode::Reprojecting
    };
    match strategy {
        ImportStrategy::BatchedSql => Ok(ImportMode::Batched),
        ImportStrategy::Auto if !bulk_available => Ok(ImportMode::Batched),
        ImportStrategy::Auto => Ok(streamed),
        ImportStrategy::BulkInsert if !bulk_available => Err(BridgeError::Config(
            "store has no bulk-insert channel; use the batched strategy".to_string(),
        )),
        ImportStrategy::BulkInsert => Ok(streamed),
    }
}

/// Import `source` into `table`.
///
/// The header is read first; if the table must be created it is created
/// before any row is sent. Rows reach the store in source order.
pub async fn import<T, R>(
    client: &CatalogClient<T>,
    table: &str,
    mut source: R,
    delimiter: Delimiter,
    options: ImportOptions,
) -> Result<ImportSummary>
where
    T: StoreTransport,
    R: AsyncRead + Unpin + Send + 'static,
{
    let job = TransferJob::new(Direction::Import, table);
    let span = job.span();
    async move {
        if table.trim().is_empty() {
            return Err(BridgeError::Schema("table name must not be empty".to_string()));
        }
        if options.batch_size == 0 {
            return Err(BridgeError::Config("batch size must be at least 1".to_string()));
        }

        let (header, prefix) = peek_header(&mut source, delimiter).await?;
        validate_header(&header)?;
        let indices = resolve_selection(&header, options.selected_columns.as_deref())?;
        let columns: Vec<String> = indices.iter().map(|&i| header[i].clone()).collect();
        let mode = choose_mode(
            options.strategy,
            is_identity(&indices, header.len()),
            delimiter,
            client.transport().supports_bulk_insert(),
        )?;
        debug!(?mode, columns = columns.len(), "Import header read");

        let table_created = if options.create_table && !client.table_exists(table).await? {
            let definitions: Vec<(&str, &str)> = columns
                .iter()
                .map(|name| {
                    let column_type = options
                        .column_types
                        .get(name)
                        .map(String::as_str)
                        .unwrap_or(DEFAULT_COLUMN_TYPE);
                    (name.as_str(), column_type)
                })
                .collect();
            client.create_table(table, &definitions).await?;
            true
        } else {
            false
        };
        for name in options.column_types.keys() {
            if !columns.contains(name) {
                warn!(column = %name, "Type given for a column that is not imported");
            }
        }

        let rows = match mode {
            ImportMode::Direct => {
                // Replay the peeked bytes, then the untouched remainder.
                let body = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(prefix)) })
                    .chain(ReaderStream::with_capacity(source, CHUNK_SIZE))
                    .boxed();
                direct(client, table, delimiter, table_created, body).await?
            }
            ImportMode::Reprojecting => {
                let replayed = Cursor::new(prefix).chain(source);
                let mut reader = AsyncRecordReader::new(replayed, delimiter);
                reader.read_record().await?;
                let projection = Projection {
                    source_width: header.len(),
                    indices,
                    header: columns,
                };
                let (body, producer) = spawn_producer(reader, projection);
                let request = InsertRequest::delimited(table)
                    .setting("input_format_with_names_use_header", "1")
                    .setting("format_csv_delimiter", OUTPUT_DELIMITER.as_char().to_string());
                let inserted = client.transport().insert_stream(request, body).await;
                let produced = producer
                    .await
                    .map_err(|e| BridgeError::Transfer(format!("producer task failed: {}", e)))?;
                // A source failure explains any insert failure it caused.
                let rows = produced?;
                inserted?;
                rows
            }
            ImportMode::Batched => {
                let replayed = Cursor::new(prefix).chain(source);
                let mut reader = AsyncRecordReader::new(replayed, delimiter);
                reader.read_record().await?;
                let outcome = insert_batched(
                    client.transport(),
                    table,
                    &columns,
                    header.len(),
                    &indices,
                    &mut reader,
                    options.batch_size,
                )
                .await?;
                debug!(batches = outcome.batches, "Batched insert complete");
                outcome.rows
            }
        };

        info!(rows, ?mode, table_created, elapsed_ms = job.elapsed_ms(), "Import complete");
        Ok(ImportSummary {
            job_id: job.id,
            rows,
            strategy: mode,
            table_created,
        })
    }
    .instrument(span)
    .await
}

async fn direct<T>(
    client: &CatalogClient<T>,
    table: &str,
    delimiter: Delimiter,
    table_created: bool,
    body: ByteStream,
) -> Result<u64>
where
    T: StoreTransport,
{
    let baseline = if table_created { 0 } else { client.row_count(table).await? };
    let request = InsertRequest::delimited(table)
        .setting("input_format_with_names_use_header", "1")
        .setting("input_format_skip_unknown_fields", "1")
        .setting("format_csv_delimiter", delimiter.as_char().to_string());
    let summary = client.transport().insert_stream(request, body).await?;

    match summary.written_rows {
        Some(rows) => Ok(rows),
        None => {
            let after = client.row_count(table).await?;
            debug!(baseline, after, "Store reported no row count; using count() delta");
            Ok(after.saturating_sub(baseline))
        }
    }
}
